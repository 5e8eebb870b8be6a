//! Room membership
//!
//! Tracks which connections sit in which broadcast room, plus the live
//! listener cache (`channel -> users presently joined`). Neither is ever used
//! for authorization.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::RwLock;

use super::connections::ConnectionContext;
use crate::types::{ChannelId, ConnectionId, TenantId, UserId};

/// Broadcast group. Every room carries the tenant it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// `company:<id>`
    Tenant(TenantId),
    /// `channel:<id>`
    Channel(TenantId, ChannelId),
}

impl Room {
    pub fn tenant(&self) -> &TenantId {
        match self {
            Room::Tenant(tenant) | Room::Channel(tenant, _) => tenant,
        }
    }

    pub fn channel(tenant: &TenantId, channel: &ChannelId) -> Self {
        Room::Channel(tenant.clone(), channel.clone())
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Tenant(tenant) => write!(f, "company:{}", tenant),
            Room::Channel(_, channel) => write!(f, "channel:{}", channel),
        }
    }
}

#[derive(Default)]
struct RoomState {
    members: HashMap<Room, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<Room>>,
    /// channel -> user -> that user's connections in the channel room
    listeners: HashMap<ChannelId, HashMap<UserId, HashSet<ConnectionId>>>,
}

impl RoomState {
    fn detach(&mut self, room: &Room, context: &ConnectionContext) -> bool {
        let conn = &context.connection_id;
        let removed = match self.members.get_mut(room) {
            Some(set) => {
                let removed = set.remove(conn);
                if set.is_empty() {
                    self.members.remove(room);
                }
                removed
            }
            None => false,
        };

        if let Some(rooms) = self.joined.get_mut(conn) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.joined.remove(conn);
            }
        }

        if let Room::Channel(_, channel) = room {
            if let Some(users) = self.listeners.get_mut(channel) {
                if let Some(conns) = users.get_mut(context.user_id()) {
                    conns.remove(conn);
                    if conns.is_empty() {
                        users.remove(context.user_id());
                    }
                }
                if users.is_empty() {
                    self.listeners.remove(channel);
                }
            }
        }

        removed
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    state: RwLock<RoomState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a connection in a room. Returns false if it was already there.
    pub async fn join(&self, room: Room, context: &ConnectionContext) -> bool {
        let conn = &context.connection_id;
        let mut state = self.state.write().await;

        if let Room::Channel(_, channel) = &room {
            state
                .listeners
                .entry(channel.clone())
                .or_default()
                .entry(context.user_id().clone())
                .or_default()
                .insert(conn.clone());
        }
        state.joined.entry(conn.clone()).or_default().insert(room.clone());
        state.members.entry(room).or_default().insert(conn.clone())
    }

    /// Take a connection out of a room. Returns false if it was not there.
    pub async fn leave(&self, room: &Room, context: &ConnectionContext) -> bool {
        self.state.write().await.detach(room, context)
    }

    /// Take a connection out of every room; returns the rooms it was in
    pub async fn leave_all(&self, context: &ConnectionContext) -> Vec<Room> {
        let mut state = self.state.write().await;
        let rooms: Vec<Room> = state
            .joined
            .get(&context.connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        for room in &rooms {
            state.detach(room, context);
        }
        rooms
    }

    pub async fn members(&self, room: &Room) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .members
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, room: &Room, conn: &ConnectionId) -> bool {
        self.state.read().await.members.get(room).is_some_and(|set| set.contains(conn))
    }

    pub async fn rooms_of(&self, conn: &ConnectionId) -> Vec<Room> {
        self.state
            .read()
            .await
            .joined
            .get(conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Users presently listening in `channel`
    pub async fn listeners(&self, channel: &ChannelId) -> HashSet<UserId> {
        self.state
            .read()
            .await
            .listeners
            .get(channel)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_listening(&self, channel: &ChannelId, user: &UserId) -> bool {
        self.state.read().await.listeners.get(channel).is_some_and(|users| users.contains_key(user))
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::types::Timestamp;

    fn context(conn: &str, user: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: ConnectionId::new(conn),
            identity: Identity {
                user_id: UserId::new(user),
                email: String::new(),
                display_name: user.to_string(),
            },
            tenant_id: TenantId::new("t"),
            tenant_role: "staff".to_string(),
            connected_at: Timestamp::now(),
        }
    }

    fn general() -> Room {
        Room::channel(&TenantId::new("t"), &ChannelId::new("general"))
    }

    #[test]
    fn test_room_names() {
        assert_eq!(Room::Tenant(TenantId::new("7")).to_string(), "company:7");
        assert_eq!(general().to_string(), "channel:general");
        assert_eq!(general().tenant(), &TenantId::new("t"));
    }

    #[tokio::test]
    async fn test_listener_survives_until_last_connection_leaves() {
        let rooms = RoomRegistry::new();
        let (c1, c2) = (context("c1", "u"), context("c2", "u"));
        let channel = ChannelId::new("general");

        assert!(rooms.join(general(), &c1).await);
        assert!(!rooms.join(general(), &c1).await);
        rooms.join(general(), &c2).await;

        assert!(rooms.leave(&general(), &c1).await);
        assert!(rooms.is_listening(&channel, &UserId::new("u")).await);

        assert!(rooms.leave(&general(), &c2).await);
        assert!(!rooms.is_listening(&channel, &UserId::new("u")).await);
        assert!(!rooms.leave(&general(), &c2).await);
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_all() {
        let rooms = RoomRegistry::new();
        let ctx = context("c1", "u");
        rooms.join(Room::Tenant(TenantId::new("t")), &ctx).await;
        rooms.join(general(), &ctx).await;

        let left = rooms.leave_all(&ctx).await;
        assert_eq!(left.len(), 2);
        assert!(rooms.rooms_of(&ctx.connection_id).await.is_empty());
        assert!(rooms.members(&general()).await.is_empty());
        assert!(rooms.listeners(&ChannelId::new("general")).await.is_empty());
    }
}
