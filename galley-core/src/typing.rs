//! Typing state machine
//!
//! `idle -> typing -> idle` per `(channel, user)`. Whichever of explicit stop,
//! timer expiry or disconnect removes the entry first emits the single
//! `isTyping: false`; the others find nothing to remove.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::errors::{RealtimeError, RealtimeResult};
use crate::fanout::Fanout;
use crate::metrics::{record_counter, TYPING_EXPIRED};
use crate::persistence::ChatStore;
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionContext, ConnectionRegistry, Room, TypingKey, TypingRegistry};
use crate::types::{ChannelId, ConnectionId, UserId};

fn indicator(channel: &ChannelId, user: &UserId, is_typing: bool) -> ServerEvent {
    ServerEvent::TypingIndicator { channel_id: channel.clone(), user_id: user.clone(), is_typing }
}

pub struct TypingStateMachine {
    store: Arc<dyn ChatStore>,
    connections: Arc<ConnectionRegistry>,
    registry: Arc<TypingRegistry>,
    fanout: Fanout,
    timeout: Duration,
}

impl TypingStateMachine {
    pub fn new(
        store: Arc<dyn ChatStore>,
        connections: Arc<ConnectionRegistry>,
        registry: Arc<TypingRegistry>,
        fanout: Fanout,
        timeout: Duration,
    ) -> Self {
        Self { store, connections, registry, fanout, timeout }
    }

    async fn require_membership(&self, ctx: &ConnectionContext, channel: &ChannelId) -> RealtimeResult<()> {
        if self.store.is_channel_member(&ctx.tenant_id, channel, ctx.user_id()).await? {
            Ok(())
        } else {
            Err(RealtimeError::access_denied())
        }
    }

    /// Arm (or re-arm) the expiry timer. `isTyping: true` goes out only on
    /// the idle -> typing transition. Returns whether that transition happened.
    ///
    /// A connection that closed while the membership check was pending has
    /// already been purged, so the fresh entry is withdrawn and no `true` goes out.
    pub async fn start(&self, ctx: &ConnectionContext, channel: &ChannelId) -> RealtimeResult<bool> {
        self.require_membership(ctx, channel).await?;

        let key: TypingKey = (channel.clone(), ctx.user_id().clone());
        let room = Room::channel(&ctx.tenant_id, channel);

        let registry = self.registry.clone();
        let fanout = self.fanout.clone();
        let timeout = self.timeout;
        let timer_key = key.clone();
        let timer_room = room.clone();

        let started = self.registry.arm(key, &ctx.tenant_id, &ctx.connection_id, move |generation| {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(entry) = registry.expire(&timer_key, generation) else {
                    return;
                };
                record_counter(TYPING_EXPIRED, 1);
                debug!(channel_id = %timer_key.0, user_id = %timer_key.1, "Typing expired");
                let event = indicator(&timer_key.0, &timer_key.1, false);
                fanout.to_room(&timer_room, event, Some(&entry.connection_id)).await;
            })
            .abort_handle()
        });

        if !self.connections.contains(&ctx.connection_id).await {
            self.registry.clear(&(channel.clone(), ctx.user_id().clone()));
            // The replaced activation came from another connection and had
            // already announced `true`
            if !started {
                let event = indicator(channel, ctx.user_id(), false);
                self.fanout.to_room(&room, event, Some(&ctx.connection_id)).await;
            }
            return Err(RealtimeError::ConnectionClosed);
        }

        if started {
            let event = indicator(channel, ctx.user_id(), true);
            self.fanout.to_room(&room, event, Some(&ctx.connection_id)).await;
        }
        Ok(started)
    }

    /// Explicit stop. Emits `isTyping: false` only if an entry was pending.
    pub async fn stop(&self, ctx: &ConnectionContext, channel: &ChannelId) -> RealtimeResult<bool> {
        self.require_membership(ctx, channel).await?;

        let key: TypingKey = (channel.clone(), ctx.user_id().clone());
        let Some(entry) = self.registry.clear(&key) else {
            return Ok(false);
        };

        let room = Room::channel(&entry.tenant_id, channel);
        self.fanout.to_room(&room, indicator(channel, ctx.user_id(), false), Some(&ctx.connection_id)).await;
        Ok(true)
    }

    /// Clear every entry the connection created, one `false` per entry
    pub async fn purge_connection(&self, conn: &ConnectionId) -> usize {
        let purged = self.registry.purge_connection(conn);
        let count = purged.len();
        for ((channel, user), entry) in purged {
            let room = Room::channel(&entry.tenant_id, &channel);
            self.fanout.to_room(&room, indicator(&channel, &user, false), Some(conn)).await;
        }
        count
    }

    pub fn is_typing(&self, channel: &ChannelId, user: &UserId) -> bool {
        self.registry.is_typing(channel, user)
    }
}
