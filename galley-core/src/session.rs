//! Per-connection actor
//!
//! A session owns a bounded command queue drained by one worker task, so a
//! connection's commands run strictly in arrival order while different
//! connections proceed concurrently.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{RealtimeError, RealtimeResult};
use crate::gateway::Gateway;
use crate::identity::Handshake;
use crate::protocol::ClientCommand;
use crate::registry::{ConnectionContext, EventReceiver};

/// One entry of the command queue. Undecodable frames queue up too, so
/// their `error` answers keep arrival order.
enum Inbound {
    Command(ClientCommand),
    Malformed(RealtimeError),
}

pub struct Session {
    gateway: Arc<Gateway>,
    context: ConnectionContext,
    commands: Option<mpsc::Sender<Inbound>>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl Session {
    /// Authenticate, register and start the worker
    pub async fn open(gateway: Arc<Gateway>, handshake: &Handshake) -> RealtimeResult<(Self, EventReceiver)> {
        let (context, events) = gateway.open(handshake).await?;
        let (commands, queue) = mpsc::channel(gateway.config().command_queue);
        let worker = tokio::spawn(run_worker(gateway.clone(), context.clone(), queue));

        let session = Self {
            gateway,
            context,
            commands: Some(commands),
            worker: Some(worker),
            closed: false,
        };
        Ok((session, events))
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    async fn enqueue(&self, inbound: Inbound) -> RealtimeResult<()> {
        let commands = self.commands.as_ref().ok_or(RealtimeError::ConnectionClosed)?;
        commands.send(inbound).await.map_err(|_| RealtimeError::ConnectionClosed)
    }

    /// Queue a command. Waits while the queue is full.
    pub async fn submit(&self, command: ClientCommand) -> RealtimeResult<()> {
        self.enqueue(Inbound::Command(command)).await
    }

    /// Decode and queue a text frame. A malformed frame is answered with an
    /// `error` event in turn and does not end the session.
    pub async fn submit_frame(&self, frame: &str) -> RealtimeResult<()> {
        let inbound = match ClientCommand::decode(frame) {
            Ok(command) => Inbound::Command(command),
            Err(e) => Inbound::Malformed(e),
        };
        self.enqueue(inbound).await
    }

    /// Queue an `error` answer for a frame the transport could not accept
    pub async fn submit_malformed(&self, err: RealtimeError) -> RealtimeResult<()> {
        self.enqueue(Inbound::Malformed(err)).await
    }

    /// Purge the connection from every registry. A command already running
    /// finishes and still broadcasts; queued commands are discarded.
    pub async fn close(mut self) {
        self.closed = true;
        self.gateway.disconnect(&self.context).await;
    }

    /// Close and wait for the worker to finish its current command
    pub async fn close_and_drain(mut self) {
        self.closed = true;
        self.gateway.disconnect(&self.context).await;
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped without close: purge in the background
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let gateway = self.gateway.clone();
            let context = self.context.clone();
            handle.spawn(async move {
                gateway.disconnect(&context).await;
            });
        }
    }
}

async fn run_worker(gateway: Arc<Gateway>, ctx: ConnectionContext, mut queue: mpsc::Receiver<Inbound>) {
    while let Some(inbound) = queue.recv().await {
        if !gateway.is_connected(&ctx.connection_id).await {
            debug!(connection_id = %ctx.connection_id, "Discarding queued commands for closed connection");
            break;
        }
        match inbound {
            Inbound::Command(command) => gateway.handle(&ctx, command).await,
            Inbound::Malformed(err) => gateway.reject(&ctx, "unknown", &err).await,
        }
    }
}
