//! HTTP and WebSocket listener

use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::api::build_router;
use crate::state::AppState;

pub struct GalleyServer {
    state: AppState,
    addr: SocketAddr,
}

impl GalleyServer {
    pub fn new(state: AppState) -> Self {
        let addr = state.server.bind_address;
        Self { state, addr }
    }

    /// Serve until the shutdown coordinator broadcasts its signal
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        let router = build_router(self.state.clone());
        info!(address = %listener.local_addr()?, "Galley listening");

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await?;

        info!("Listener stopped");
        Ok(())
    }
}
