//! Live connections and their outbound queues

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::identity::Identity;
use crate::persistence::UserSummary;
use crate::protocol::ServerEvent;
use crate::types::{ConnectionId, TenantId, Timestamp, UserId};

/// Sending half of a connection's bounded event queue
pub type EventSender = mpsc::Sender<Arc<ServerEvent>>;
pub type EventReceiver = mpsc::Receiver<Arc<ServerEvent>>;

/// Identity and tenant bound to a connection at handshake. Immutable for the
/// connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub tenant_id: TenantId,
    /// Role inside the tenant, as reported by the identity provider
    pub tenant_role: String,
    pub connected_at: Timestamp,
}

impl ConnectionContext {
    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn summary(&self) -> UserSummary {
        self.identity.summary()
    }
}

struct ConnectionEntry {
    context: ConnectionContext,
    sender: EventSender,
}

/// Route target resolved from the registry for fan-out
pub struct Recipient {
    pub connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub sender: EventSender,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, context: ConnectionContext, sender: EventSender) {
        let id = context.connection_id.clone();
        self.entries.write().await.insert(id, ConnectionEntry { context, sender });
    }

    /// Remove a connection; `None` if it was already gone
    pub async fn remove(&self, id: &ConnectionId) -> Option<ConnectionContext> {
        self.entries.write().await.remove(id).map(|entry| entry.context)
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn context(&self, id: &ConnectionId) -> Option<ConnectionContext> {
        self.entries.read().await.get(id).map(|entry| entry.context.clone())
    }

    pub async fn recipient(&self, id: &ConnectionId) -> Option<Recipient> {
        self.entries.read().await.get(id).map(|entry| Recipient {
            connection_id: id.clone(),
            tenant_id: entry.context.tenant_id.clone(),
            sender: entry.sender.clone(),
        })
    }

    /// Resolve queues for `ids`, skipping connections that are gone
    pub async fn recipients<'a, I>(&self, ids: I) -> Vec<Recipient>
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        let entries = self.entries.read().await;
        ids.into_iter()
            .filter_map(|id| {
                entries.get(id).map(|entry| Recipient {
                    connection_id: id.clone(),
                    tenant_id: entry.context.tenant_id.clone(),
                    sender: entry.sender.clone(),
                })
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Connections belonging to `user` within `tenant`
    pub async fn user_connections(&self, tenant: &TenantId, user: &UserId) -> Vec<ConnectionId> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| &e.context.tenant_id == tenant && e.context.user_id() == user)
            .map(|e| e.context.connection_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(conn: &str, user: &str, tenant: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: ConnectionId::new(conn),
            identity: Identity {
                user_id: UserId::new(user),
                email: format!("{}@example.com", user),
                display_name: user.to_string(),
            },
            tenant_id: TenantId::new(tenant),
            tenant_role: "staff".to_string(),
            connected_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(context("c1", "u1", "t1"), tx).await;

        assert!(registry.contains(&ConnectionId::new("c1")).await);
        assert_eq!(registry.count().await, 1);
        assert_eq!(
            registry.user_connections(&TenantId::new("t1"), &UserId::new("u1")).await,
            vec![ConnectionId::new("c1")]
        );

        assert!(registry.remove(&ConnectionId::new("c1")).await.is_some());
        assert!(registry.remove(&ConnectionId::new("c1")).await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_recipients_skip_missing() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(context("c1", "u1", "t1"), tx).await;

        let ids = [ConnectionId::new("c1"), ConnectionId::new("ghost")];
        let recipients = registry.recipients(ids.iter()).await;
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].tenant_id, TenantId::new("t1"));
    }
}
