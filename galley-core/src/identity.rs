//! Identity resolution
//!
//! The session/identity provider is an external collaborator. At handshake
//! time the gateway asks it who owns a session token and which tenants that
//! user belongs to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::persistence::{StoreResult, UserSummary};
use crate::types::{TenantId, Timestamp, UserId};

/// Caller identity behind a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
}

impl Identity {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantMembership {
    pub tenant_id: TenantId,
    pub role: String,
    pub active: bool,
    pub joined_at: Timestamp,
}

/// Raw handshake data presented by a connecting client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Handshake {
    pub token: String,
    /// Preferred tenant when the user belongs to several
    pub tenant: Option<TenantId>,
}

impl Handshake {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into(), tenant: None }
    }

    pub fn for_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Identity owning `token`, or `None` for unknown or expired sessions
    async fn resolve_session(&self, token: &str) -> StoreResult<Option<Identity>>;

    /// Tenant memberships of `user`, oldest first
    async fn memberships(&self, user: &UserId) -> StoreResult<Vec<TenantMembership>>;
}

/// Pick the tenant a connection binds to
///
/// With a hint, only a matching active membership qualifies. Without one the
/// oldest active membership wins.
pub fn select_membership<'a>(
    memberships: &'a [TenantMembership],
    hint: Option<&TenantId>,
) -> Option<&'a TenantMembership> {
    let mut active = memberships.iter().filter(|m| m.active);
    match hint {
        Some(tenant) => active.find(|m| &m.tenant_id == tenant),
        None => active.min_by_key(|m| m.joined_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(tenant: &str, active: bool, joined: u64) -> TenantMembership {
        TenantMembership {
            tenant_id: TenantId::new(tenant),
            role: "staff".to_string(),
            active,
            joined_at: Timestamp::from_millis(joined),
        }
    }

    #[test]
    fn test_select_oldest_active() {
        let memberships =
            vec![membership("late", true, 20), membership("gone", false, 1), membership("early", true, 10)];
        let chosen = select_membership(&memberships, None).unwrap();
        assert_eq!(chosen.tenant_id, TenantId::new("early"));
    }

    #[test]
    fn test_hint_must_match_active_membership() {
        let memberships = vec![membership("a", true, 1), membership("b", false, 2)];
        assert!(select_membership(&memberships, Some(&TenantId::new("b"))).is_none());
        assert!(select_membership(&memberships, Some(&TenantId::new("zzz"))).is_none());
        assert_eq!(
            select_membership(&memberships, Some(&TenantId::new("a"))).unwrap().tenant_id,
            TenantId::new("a")
        );
    }

    #[test]
    fn test_no_active_membership() {
        let memberships = vec![membership("a", false, 1)];
        assert!(select_membership(&memberships, None).is_none());
        assert!(select_membership(&[], None).is_none());
    }
}
