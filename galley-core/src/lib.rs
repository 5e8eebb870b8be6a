//! Galley real-time collaboration core
//!
//! Authenticates connections, binds each one to a tenant and its rooms,
//! tracks multi-device presence, relays message mutations and drives the
//! self-expiring typing indicator, without ever crossing a tenant boundary.

pub mod config;
pub mod errors;
pub mod fanout;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod membership;
pub mod messages;
pub mod metrics;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod test_utils;
pub mod typing;
pub mod types;

pub use config::Config;
pub use errors::{RealtimeError, RealtimeResult};
pub use gateway::Gateway;
pub use identity::{Handshake, Identity, IdentityResolver};
pub use logging::{init_logging, LogLevel};
pub use persistence::{ChatStore, InMemoryChatStore, SqliteStore};
pub use protocol::{ClientCommand, PresenceStatus, ServerEvent};
pub use session::Session;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = PresenceStatus::Online;
        let _ = Config::default();
    }
}
