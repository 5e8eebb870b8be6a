//! Graceful shutdown coordinator
//!
//! Connection actors hold a [`DrainGuard`] and listen for the shutdown
//! signal. On shutdown the coordinator broadcasts the signal and waits, up to
//! its timeout, for every guard to be dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

#[derive(Default)]
struct Drain {
    active: AtomicUsize,
    idle: Notify,
}

/// Held by each live connection; dropping it marks the connection drained
pub struct DrainGuard {
    drain: Arc<Drain>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.drain.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drain.idle.notify_waiters();
        }
    }
}

pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    drain: Arc<Drain>,
    stopped: Notify,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: RwLock::new(ShutdownState::Running),
            shutdown_tx,
            drain: Arc::new(Drain::default()),
            stopped: Notify::new(),
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Register a connection that must drain before shutdown completes
    pub fn track(&self) -> DrainGuard {
        self.drain.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard { drain: self.drain.clone() }
    }

    pub fn active(&self) -> usize {
        self.drain.active.load(Ordering::SeqCst)
    }

    /// Broadcast the graceful signal and wait for connections to drain.
    /// Returns false if the timeout elapsed first.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return false;
            }
            *state = ShutdownState::ShuttingDown;
        }

        info!(active = self.active(), "Initiating graceful shutdown");
        if let Err(e) = self.shutdown_tx.send(ShutdownSignal::Graceful) {
            // No subscribers: nothing to drain
            info!("No shutdown subscribers: {}", e);
        }

        let drained = tokio::time::timeout(self.timeout, self.wait_drained()).await.is_ok();
        if !drained {
            error!(remaining = self.active(), "Shutdown timeout elapsed with connections still open");
        }

        *self.state.write().await = ShutdownState::Shutdown;
        self.stopped.notify_waiters();
        info!("Shutdown complete");
        drained
    }

    /// Signal every component to stop without waiting
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");
        *self.state.write().await = ShutdownState::Shutdown;
        self.stopped.notify_waiters();

        if let Err(e) = self.shutdown_tx.send(ShutdownSignal::Immediate) {
            error!("Failed to send immediate shutdown signal: {}", e);
        }
    }

    async fn wait_drained(&self) {
        loop {
            let idle = self.drain.idle.notified();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Resolve once the coordinator reaches [`ShutdownState::Shutdown`]
    pub async fn wait_until_stopped(&self) {
        loop {
            let stopped = self.stopped.notified();
            if self.state().await == ShutdownState::Shutdown {
                return;
            }
            stopped.await;
        }
    }

    /// Resolve once a shutdown signal is broadcast
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown().await;
    });
    Ok(())
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> std::io::Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                coordinator.shutdown().await;
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
    Ok(())
}
