//! Registry store
//!
//! Shared, mutation-safe in-memory state mirroring persisted facts for fast
//! fan-out decisions. Every map is private to its registry and reached only
//! through a narrow get/add/remove interface. The registries are advisory:
//! authorization always re-reads the persistence layer.

mod connections;
mod presence;
mod rooms;
mod typing;

use std::sync::Arc;

pub use connections::{
    ConnectionContext, ConnectionRegistry, EventReceiver, EventSender, Recipient,
};
pub use presence::{Attached, Detached, PresenceRegistry};
pub use rooms::{Room, RoomRegistry};
pub use typing::{TypingEntry, TypingKey, TypingRegistry};

/// Handles to every registry, shared by the gateway and its components
#[derive(Clone, Default)]
pub struct Registry {
    pub connections: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub typing: Arc<TypingRegistry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
}
