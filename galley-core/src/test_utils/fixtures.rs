//! Test fixtures for building a running gateway over the in-memory store

use std::sync::Arc;

use crate::config::RealtimeConfig;
use crate::gateway::Gateway;
use crate::identity::{Handshake, Identity, TenantMembership};
use crate::persistence::{Channel, ChannelRole, InMemoryChatStore};
use crate::protocol::ClientCommand;
use crate::registry::Room;
use crate::session::Session;
use crate::types::{ChannelId, TenantId, Timestamp, UserId};

use super::client::{wait_until, TestClient};

/// A seeded user with a valid session token
#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: UserId,
    pub display_name: String,
    pub token: String,
}

/// Gateway plus the store behind it
pub struct TestWorld {
    pub store: Arc<InMemoryChatStore>,
    pub gateway: Arc<Gateway>,
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_config(RealtimeConfig::default())
    }

    pub fn with_config(config: RealtimeConfig) -> Self {
        let store = Arc::new(InMemoryChatStore::new());
        let gateway = Arc::new(Gateway::new(config, store.clone(), store.clone()));
        Self { store, gateway }
    }

    /// Seed a user with an active membership in `tenant`
    pub async fn user(&self, tenant: &TenantId, name: &str) -> TestUser {
        let user = TestUserBuilder::new(name).build(self).await;
        self.add_membership(&user, tenant, true).await;
        user
    }

    pub async fn add_membership(&self, user: &TestUser, tenant: &TenantId, active: bool) {
        self.store
            .add_membership(
                &user.id,
                TenantMembership {
                    tenant_id: tenant.clone(),
                    role: "staff".to_string(),
                    active,
                    joined_at: Timestamp::now(),
                },
            )
            .await;
    }

    /// Seed a channel. The first member becomes owner, the rest members.
    pub async fn channel(&self, tenant: &TenantId, name: &str, members: &[&TestUser]) -> ChannelId {
        let now = Timestamp::now();
        let creator = members.first().map(|u| u.id.clone()).unwrap_or_else(|| UserId::new("system"));
        let channel = Channel {
            id: ChannelId::generate(),
            tenant_id: tenant.clone(),
            name: name.to_string(),
            description: None,
            is_private: false,
            created_by: creator,
            created_at: now,
            last_activity_at: now,
        };
        let id = channel.id.clone();
        self.store.add_channel(channel).await;

        for (i, member) in members.iter().enumerate() {
            let role = if i == 0 { ChannelRole::Owner } else { ChannelRole::Member };
            self.store.add_channel_member(&id, &member.id, role).await;
        }
        id
    }

    /// Join `channel` and wait until the room registry reflects it
    pub async fn join(&self, client: &TestClient, channel: &ChannelId) {
        client.send(ClientCommand::JoinChannel { channel_id: channel.clone() }).await;
        let room = Room::channel(&client.context().tenant_id, channel);
        let (rooms, room, conn) = (&self.gateway.registry().rooms, &room, client.connection_id());
        wait_until(move || rooms.is_member(room, conn)).await;
    }

    pub async fn connect(&self, user: &TestUser) -> TestClient {
        self.connect_with(Handshake::new(user.token.clone())).await
    }

    pub async fn connect_to(&self, user: &TestUser, tenant: &TenantId) -> TestClient {
        self.connect_with(Handshake::new(user.token.clone()).for_tenant(tenant.clone())).await
    }

    pub async fn connect_with(&self, handshake: Handshake) -> TestClient {
        let (session, events) = Session::open(self.gateway.clone(), &handshake)
            .await
            .expect("handshake should succeed");
        TestClient::new(session, events)
    }
}

/// Builder for seeded users
pub struct TestUserBuilder {
    name: String,
    email: Option<String>,
    token: Option<String>,
}

impl TestUserBuilder {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), email: None, token: None }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Seed identity and session; no tenant membership
    pub async fn build(self, world: &TestWorld) -> TestUser {
        let id = UserId::generate();
        let token = self.token.unwrap_or_else(|| format!("token-{}-{}", self.name, id));
        world
            .store
            .add_user(Identity {
                user_id: id.clone(),
                email: self.email.unwrap_or_else(|| format!("{}@example.com", self.name)),
                display_name: self.name.clone(),
            })
            .await;
        world.store.add_session(&token, &id).await;
        TestUser { id, display_name: self.name, token }
    }
}
