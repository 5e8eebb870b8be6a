//! Connection gateway
//!
//! Authenticates handshakes, binds each connection to one tenant, owns the
//! registries and routes every decoded command through a single dispatch
//! table. Command failures become caller-only `error` events; the connection
//! stays open.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::errors::{RealtimeError, RealtimeResult};
use crate::fanout::Fanout;
use crate::identity::{select_membership, Handshake, IdentityResolver};
use crate::membership::ChannelRouter;
use crate::messages::MessagePipeline;
use crate::metrics::{
    self, record_counter, record_gauge, Timer, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED,
    CONNECTIONS_OPENED, CONNECTIONS_REJECTED,
};
use crate::persistence::ChatStore;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientCommand, ServerEvent};
use crate::registry::{ConnectionContext, EventReceiver, Registry, Room};
use crate::relay::DomainEventRelay;
use crate::typing::TypingStateMachine;
use crate::types::{ConnectionId, Timestamp};

pub struct Gateway {
    config: RealtimeConfig,
    identity: Arc<dyn IdentityResolver>,
    registry: Registry,
    fanout: Fanout,
    presence: PresenceTracker,
    channels: ChannelRouter,
    messages: MessagePipeline,
    typing: TypingStateMachine,
    relay: DomainEventRelay,
}

impl Gateway {
    pub fn new(
        config: RealtimeConfig,
        store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let registry = Registry::new();
        let fanout = Fanout::new(registry.connections.clone(), registry.rooms.clone());

        Self {
            presence: PresenceTracker::new(registry.presence.clone(), fanout.clone(), config.presence_policy),
            channels: ChannelRouter::new(
                store.clone(),
                registry.connections.clone(),
                registry.rooms.clone(),
                fanout.clone(),
                config.clone(),
            ),
            messages: MessagePipeline::new(store.clone(), fanout.clone(), config.clone()),
            typing: TypingStateMachine::new(
                store,
                registry.connections.clone(),
                registry.typing.clone(),
                fanout.clone(),
                config.typing_timeout,
            ),
            relay: DomainEventRelay::new(fanout.clone()),
            config,
            identity,
            registry,
            fanout,
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn typing(&self) -> &TypingStateMachine {
        &self.typing
    }

    pub fn relay(&self) -> &DomainEventRelay {
        &self.relay
    }

    pub async fn active_connections(&self) -> usize {
        self.registry.connections.count().await
    }

    pub async fn is_connected(&self, conn: &ConnectionId) -> bool {
        self.registry.connections.contains(conn).await
    }

    /// Resolve the session and pick the tenant. Registers nothing.
    pub async fn authenticate(&self, handshake: &Handshake) -> RealtimeResult<ConnectionContext> {
        let identity = self
            .identity
            .resolve_session(&handshake.token)
            .await?
            .ok_or_else(|| RealtimeError::Authentication("invalid session".to_string()))?;

        let memberships = self.identity.memberships(&identity.user_id).await?;
        let membership = select_membership(&memberships, handshake.tenant.as_ref())
            .ok_or_else(|| RealtimeError::Authentication("no active membership".to_string()))?;

        Ok(ConnectionContext {
            connection_id: ConnectionId::generate(),
            tenant_id: membership.tenant_id.clone(),
            tenant_role: membership.role.clone(),
            identity,
            connected_at: Timestamp::now(),
        })
    }

    /// Register an authenticated connection, join its tenant room and
    /// announce presence. Returns the connection's event stream.
    pub async fn connect(&self, ctx: &ConnectionContext) -> EventReceiver {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        self.registry.connections.register(ctx.clone(), tx).await;
        self.registry.rooms.join(Room::Tenant(ctx.tenant_id.clone()), ctx).await;

        record_counter(CONNECTIONS_OPENED, 1);
        record_gauge(CONNECTIONS_ACTIVE, self.active_connections().await as f64);
        info!(
            connection_id = %ctx.connection_id,
            user_id = %ctx.user_id(),
            tenant_id = %ctx.tenant_id,
            "Connection established"
        );

        self.presence.on_connect(ctx).await;
        rx
    }

    /// Authenticate then connect
    pub async fn open(&self, handshake: &Handshake) -> RealtimeResult<(ConnectionContext, EventReceiver)> {
        match self.authenticate(handshake).await {
            Ok(ctx) => {
                let events = self.connect(&ctx).await;
                Ok((ctx, events))
            }
            Err(e) => {
                record_counter(CONNECTIONS_REJECTED, 1);
                match &e {
                    RealtimeError::Authentication(reason) => info!(reason = %reason, "Handshake rejected"),
                    other => warn!(error = %other, "Handshake failed"),
                }
                Err(e)
            }
        }
    }

    /// Purge a connection from every registry. Safe to call more than once;
    /// only the first call has effects.
    pub async fn disconnect(&self, ctx: &ConnectionContext) -> bool {
        if self.registry.connections.remove(&ctx.connection_id).await.is_none() {
            return false;
        }

        let rooms = self.registry.rooms.leave_all(ctx).await;
        let typing = self.typing.purge_connection(&ctx.connection_id).await;
        self.presence.on_disconnect(ctx).await;

        record_counter(CONNECTIONS_CLOSED, 1);
        record_gauge(CONNECTIONS_ACTIVE, self.active_connections().await as f64);
        info!(
            connection_id = %ctx.connection_id,
            user_id = %ctx.user_id(),
            tenant_id = %ctx.tenant_id,
            rooms = rooms.len(),
            typing,
            "Connection closed"
        );
        true
    }

    /// Run one command against the caller's context
    pub async fn dispatch(&self, ctx: &ConnectionContext, command: ClientCommand) -> RealtimeResult<()> {
        match command {
            ClientCommand::JoinChannel { channel_id } => self.channels.join(ctx, &channel_id).await,
            ClientCommand::LeaveChannel { channel_id } => self.channels.leave(ctx, &channel_id).await,
            ClientCommand::CreateChannel { name, description, is_private } => {
                self.channels.create(ctx, &name, description.as_deref(), is_private).await.map(|_| ())
            }
            ClientCommand::SendMessage { channel_id, content, reply_to } => {
                self.messages.send(ctx, &channel_id, &content, reply_to.as_ref()).await.map(|_| ())
            }
            ClientCommand::EditMessage { message_id, content } => {
                self.messages.edit(ctx, &message_id, &content).await.map(|_| ())
            }
            ClientCommand::DeleteMessage { message_id } => self.messages.delete(ctx, &message_id).await,
            ClientCommand::React { message_id, emoji } => {
                self.messages.react(ctx, &message_id, &emoji).await.map(|_| ())
            }
            ClientCommand::TypingStart { channel_id } => self.typing.start(ctx, &channel_id).await.map(|_| ()),
            ClientCommand::TypingStop { channel_id } => self.typing.stop(ctx, &channel_id).await.map(|_| ()),
            ClientCommand::UpdatePresence { status } => self.presence.update_status(ctx, status).await,
        }
    }

    /// Dispatch and convert any failure into an `error` event for the caller
    pub async fn handle(&self, ctx: &ConnectionContext, command: ClientCommand) {
        let name = command.name();
        metrics::command_dispatched(name);
        let timer = Timer::for_command(name);

        let result = self.dispatch(ctx, command).await;
        timer.stop();

        if let Err(e) = result {
            self.reject(ctx, name, &e).await;
        }
    }

    /// Report a failed command to its caller only
    pub async fn reject(&self, ctx: &ConnectionContext, command: &'static str, err: &RealtimeError) {
        metrics::command_failed(command, err.code());
        match err {
            RealtimeError::Persistence(_) => {
                warn!(connection_id = %ctx.connection_id, command, error = %err, "Command failed to persist")
            }
            RealtimeError::Internal(_) => {
                error!(connection_id = %ctx.connection_id, command, error = %err, "Command failed")
            }
            _ => debug!(connection_id = %ctx.connection_id, command, code = err.code(), error = %err, "Command rejected"),
        }
        self.fanout.to_connection(&ctx.connection_id, ServerEvent::error(err)).await;
    }
}
