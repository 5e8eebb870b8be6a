//! State shared by every request handler and connection actor

use std::sync::Arc;
use std::time::Instant;

use galley_core::config::ServerConfig;
use galley_core::shutdown::ShutdownCoordinator;
use galley_core::Gateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub server: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, shutdown: Arc<ShutdownCoordinator>, server: ServerConfig) -> Self {
        Self { gateway, shutdown, server: Arc::new(server), started_at: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
