//! The single fan-out primitive every component emits through
//!
//! Delivery is best-effort: each recipient has a bounded queue and a full
//! queue drops the event for that recipient only.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use crate::metrics::{record_counter, EVENTS_DELIVERED, EVENTS_DROPPED};
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionRegistry, Recipient, Room, RoomRegistry};
use crate::types::ConnectionId;

#[derive(Clone)]
pub struct Fanout {
    connections: Arc<ConnectionRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl Fanout {
    pub fn new(connections: Arc<ConnectionRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        Self { connections, rooms }
    }

    /// Deliver `event` to every connection in `room` except `except`.
    /// Returns the number of connections the event was queued for.
    pub async fn to_room(&self, room: &Room, event: ServerEvent, except: Option<&ConnectionId>) -> usize {
        let members = self.rooms.members(room).await;
        let targets = members.iter().filter(|conn| Some(*conn) != except);
        let recipients = self.connections.recipients(targets).await;

        let event = Arc::new(event);
        let mut delivered = 0;
        for recipient in recipients {
            if &recipient.tenant_id != room.tenant() {
                error!(
                    room = %room,
                    connection_id = %recipient.connection_id,
                    tenant_id = %recipient.tenant_id,
                    "Refusing cross-tenant delivery"
                );
                continue;
            }
            if push(&recipient, event.clone()) {
                delivered += 1;
            }
        }

        debug!(room = %room, event = event.name(), delivered, "Broadcast");
        delivered
    }

    /// Deliver `event` to one connection. False if it is gone or saturated.
    pub async fn to_connection(&self, conn: &ConnectionId, event: ServerEvent) -> bool {
        match self.connections.recipient(conn).await {
            Some(recipient) => push(&recipient, Arc::new(event)),
            None => false,
        }
    }
}

fn push(recipient: &Recipient, event: Arc<ServerEvent>) -> bool {
    match recipient.sender.try_send(event) {
        Ok(()) => {
            record_counter(EVENTS_DELIVERED, 1);
            true
        }
        Err(TrySendError::Full(event)) => {
            record_counter(EVENTS_DROPPED, 1);
            warn!(
                connection_id = %recipient.connection_id,
                event = event.name(),
                "Outbound queue full, dropping event"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            record_counter(EVENTS_DROPPED, 1);
            debug!(connection_id = %recipient.connection_id, "Outbound queue closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::registry::ConnectionContext;
    use crate::types::{TenantId, Timestamp, UserId};
    use tokio::sync::mpsc;

    fn context(conn: &str, tenant: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: ConnectionId::new(conn),
            identity: Identity {
                user_id: UserId::new(format!("user-{}", conn)),
                email: String::new(),
                display_name: conn.to_string(),
            },
            tenant_id: TenantId::new(tenant),
            tenant_role: "staff".to_string(),
            connected_at: Timestamp::now(),
        }
    }

    fn ping() -> ServerEvent {
        ServerEvent::Error { message: "ping".into(), code: None }
    }

    #[tokio::test]
    async fn test_excludes_sender() {
        let connections = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(connections.clone(), rooms.clone());
        let room = Room::Tenant(TenantId::new("t"));

        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        for (ctx, tx) in [(context("a", "t"), tx1), (context("b", "t"), tx2)] {
            rooms.join(room.clone(), &ctx).await;
            connections.register(ctx, tx).await;
        }

        let delivered = fanout.to_room(&room, ping(), Some(&ConnectionId::new("a"))).await;
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking_others() {
        let connections = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(connections.clone(), rooms.clone());
        let room = Room::Tenant(TenantId::new("t"));

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        for (ctx, tx) in [(context("slow", "t"), slow_tx), (context("fast", "t"), fast_tx)] {
            rooms.join(room.clone(), &ctx).await;
            connections.register(ctx, tx).await;
        }

        assert_eq!(fanout.to_room(&room, ping(), None).await, 2);
        assert_eq!(fanout.to_room(&room, ping(), None).await, 1);
        assert_eq!(fast_rx.recv().await.unwrap().name(), "error");
        assert_eq!(fast_rx.recv().await.unwrap().name(), "error");
    }

    #[tokio::test]
    async fn test_never_crosses_tenants() {
        let connections = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let fanout = Fanout::new(connections.clone(), rooms.clone());
        let room = Room::Tenant(TenantId::new("a"));

        // A connection from tenant b wrongly placed in tenant a's room
        let intruder = context("x", "b");
        let (tx, mut rx) = mpsc::channel(4);
        rooms.join(room.clone(), &intruder).await;
        connections.register(intruder, tx).await;

        assert_eq!(fanout.to_room(&room, ping(), None).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_to_connection() {
        let connections = Arc::new(ConnectionRegistry::new());
        let fanout = Fanout::new(connections.clone(), Arc::new(RoomRegistry::new()));
        let (tx, mut rx) = mpsc::channel(1);
        connections.register(context("a", "t"), tx).await;

        assert!(fanout.to_connection(&ConnectionId::new("a"), ping()).await);
        assert!(!fanout.to_connection(&ConnectionId::new("gone"), ping()).await);
        assert!(rx.recv().await.is_some());
    }
}
