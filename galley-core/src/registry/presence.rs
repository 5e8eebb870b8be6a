//! Per-user connection sets
//!
//! A user is online in a tenant iff their connection set is non-empty.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::protocol::PresenceStatus;
use crate::types::{ConnectionId, TenantId, Timestamp, UserId};

#[derive(Debug)]
struct PresenceEntry {
    connections: HashSet<ConnectionId>,
    /// Last explicit status; cleared with the entry
    status: PresenceStatus,
    last_seen: Timestamp,
}

/// Result of adding a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    /// The set was empty before this connection
    pub first: bool,
    pub connections: usize,
}

/// Result of removing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Other connections keep the user online
    StillOnline(usize),
    /// The set became empty and the entry was dropped
    WentOffline,
    /// The connection was not tracked (already removed)
    Unknown,
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<(TenantId, UserId), PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, tenant: &TenantId, user: &UserId, conn: &ConnectionId) -> Attached {
        let mut entries = self.entries.write().await;
        let entry = entries.entry((tenant.clone(), user.clone())).or_insert_with(|| PresenceEntry {
            connections: HashSet::new(),
            status: PresenceStatus::Online,
            last_seen: Timestamp::now(),
        });
        let first = entry.connections.is_empty();
        entry.connections.insert(conn.clone());
        entry.last_seen = Timestamp::now();
        Attached { first, connections: entry.connections.len() }
    }

    pub async fn detach(&self, tenant: &TenantId, user: &UserId, conn: &ConnectionId) -> Detached {
        let mut entries = self.entries.write().await;
        let key = (tenant.clone(), user.clone());
        let Some(entry) = entries.get_mut(&key) else {
            return Detached::Unknown;
        };
        if !entry.connections.remove(conn) {
            return Detached::Unknown;
        }
        if entry.connections.is_empty() {
            entries.remove(&key);
            return Detached::WentOffline;
        }
        entry.last_seen = Timestamp::now();
        Detached::StillOnline(entry.connections.len())
    }

    /// Record an explicit status. Returns the last-seen timestamp, or `None`
    /// when the user has no live connection.
    pub async fn set_status(&self, tenant: &TenantId, user: &UserId, status: PresenceStatus) -> Option<Timestamp> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&(tenant.clone(), user.clone()))?;
        entry.status = status;
        entry.last_seen = Timestamp::now();
        Some(entry.last_seen)
    }

    /// Aggregate status; `Offline` when no connection is live
    pub async fn status(&self, tenant: &TenantId, user: &UserId) -> PresenceStatus {
        self.entries
            .read()
            .await
            .get(&(tenant.clone(), user.clone()))
            .map(|entry| entry.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub async fn connection_count(&self, tenant: &TenantId, user: &UserId) -> usize {
        self.entries
            .read()
            .await
            .get(&(tenant.clone(), user.clone()))
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    pub async fn online_users(&self, tenant: &TenantId) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|(t, _)| t == tenant)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (TenantId, UserId) {
        (TenantId::new("t"), UserId::new("u"))
    }

    #[tokio::test]
    async fn test_two_connections_one_offline_transition() {
        let registry = PresenceRegistry::new();
        let (tenant, user) = ids();
        let (c1, c2) = (ConnectionId::new("c1"), ConnectionId::new("c2"));

        assert!(registry.attach(&tenant, &user, &c1).await.first);
        assert!(!registry.attach(&tenant, &user, &c2).await.first);

        assert_eq!(registry.detach(&tenant, &user, &c1).await, Detached::StillOnline(1));
        assert_eq!(registry.detach(&tenant, &user, &c2).await, Detached::WentOffline);
        assert_eq!(registry.detach(&tenant, &user, &c2).await, Detached::Unknown);
        assert_eq!(registry.status(&tenant, &user).await, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_status_cleared_on_offline() {
        let registry = PresenceRegistry::new();
        let (tenant, user) = ids();
        let conn = ConnectionId::new("c1");

        assert!(registry.set_status(&tenant, &user, PresenceStatus::Away).await.is_none());

        registry.attach(&tenant, &user, &conn).await;
        assert!(registry.set_status(&tenant, &user, PresenceStatus::Busy).await.is_some());
        assert_eq!(registry.status(&tenant, &user).await, PresenceStatus::Busy);

        registry.detach(&tenant, &user, &conn).await;
        registry.attach(&tenant, &user, &conn).await;
        assert_eq!(registry.status(&tenant, &user).await, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_presence_is_per_tenant() {
        let registry = PresenceRegistry::new();
        let user = UserId::new("u");
        registry.attach(&TenantId::new("a"), &user, &ConnectionId::new("c1")).await;

        assert_eq!(registry.online_users(&TenantId::new("a")).await, vec![user.clone()]);
        assert!(registry.online_users(&TenantId::new("b")).await.is_empty());
    }
}
