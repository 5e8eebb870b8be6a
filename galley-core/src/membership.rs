//! Channel membership router
//!
//! Keeps room membership consistent with persisted channel membership. Every
//! join re-reads the store; the live cache is only touched after the store
//! has said yes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ChannelAnnouncePolicy, RealtimeConfig};
use crate::errors::{RealtimeError, RealtimeResult};
use crate::fanout::Fanout;
use crate::persistence::{Channel, ChatStore, NewChannel};
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionContext, ConnectionRegistry, Room, RoomRegistry};
use crate::types::ChannelId;

/// Non-empty after trimming and at most `max` characters
pub(crate) fn validate_text(field: &str, value: &str, max: usize) -> RealtimeResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RealtimeError::InvalidCommand(format!("{} must not be empty", field)));
    }
    if trimmed.chars().count() > max {
        return Err(RealtimeError::InvalidCommand(format!(
            "{} exceeds {} characters",
            field, max
        )));
    }
    Ok(trimmed.to_string())
}

pub struct ChannelRouter {
    store: Arc<dyn ChatStore>,
    connections: Arc<ConnectionRegistry>,
    rooms: Arc<RoomRegistry>,
    fanout: Fanout,
    config: RealtimeConfig,
}

impl ChannelRouter {
    pub fn new(
        store: Arc<dyn ChatStore>,
        connections: Arc<ConnectionRegistry>,
        rooms: Arc<RoomRegistry>,
        fanout: Fanout,
        config: RealtimeConfig,
    ) -> Self {
        Self { store, connections, rooms, fanout, config }
    }

    /// Place the connection in a room, backing out if it closed meanwhile.
    /// Disconnect removes the connection before purging rooms, so a join that
    /// lands after the purge sees the removal here.
    async fn enter(&self, room: &Room, ctx: &ConnectionContext) -> RealtimeResult<bool> {
        let added = self.rooms.join(room.clone(), ctx).await;
        if !self.connections.contains(&ctx.connection_id).await {
            self.rooms.leave(room, ctx).await;
            return Err(RealtimeError::ConnectionClosed);
        }
        Ok(added)
    }

    pub async fn join(&self, ctx: &ConnectionContext, channel: &ChannelId) -> RealtimeResult<()> {
        let allowed = self.store.is_channel_member(&ctx.tenant_id, channel, ctx.user_id()).await?;
        if !allowed {
            debug!(user_id = %ctx.user_id(), channel_id = %channel, "Join refused");
            return Err(RealtimeError::access_denied());
        }

        let room = Room::channel(&ctx.tenant_id, channel);
        if !self.enter(&room, ctx).await? {
            return Ok(());
        }

        debug!(connection_id = %ctx.connection_id, channel_id = %channel, "Joined channel");
        let event = ServerEvent::ChannelJoined { channel_id: channel.clone(), user: ctx.summary() };
        self.fanout.to_room(&room, event, Some(&ctx.connection_id)).await;
        Ok(())
    }

    pub async fn leave(&self, ctx: &ConnectionContext, channel: &ChannelId) -> RealtimeResult<()> {
        let room = Room::channel(&ctx.tenant_id, channel);
        if !self.rooms.leave(&room, ctx).await {
            return Ok(());
        }

        debug!(connection_id = %ctx.connection_id, channel_id = %channel, "Left channel");
        let event = ServerEvent::ChannelLeft { channel_id: channel.clone(), user: ctx.summary() };
        self.fanout.to_room(&room, event, Some(&ctx.connection_id)).await;
        Ok(())
    }

    pub async fn create(
        &self,
        ctx: &ConnectionContext,
        name: &str,
        description: Option<&str>,
        is_private: bool,
    ) -> RealtimeResult<Channel> {
        let name = validate_text("channel name", name, self.config.max_channel_name_length)?;
        let description = description.map(str::trim).filter(|d| !d.is_empty()).map(str::to_string);

        let channel = self
            .store
            .create_channel(NewChannel {
                tenant_id: ctx.tenant_id.clone(),
                name,
                description,
                is_private,
                creator: ctx.user_id().clone(),
            })
            .await?;

        info!(
            channel_id = %channel.id,
            tenant_id = %channel.tenant_id,
            is_private = channel.is_private,
            "Channel created"
        );

        let room = Room::channel(&ctx.tenant_id, &channel.id);
        if let Err(e) = self.enter(&room, ctx).await {
            debug!(channel_id = %channel.id, error = %e, "Creator gone before auto-join");
        }

        let target = match (channel.is_private, self.config.private_channel_announce) {
            (true, ChannelAnnouncePolicy::Members) => room,
            _ => Room::Tenant(ctx.tenant_id.clone()),
        };
        self.fanout.to_room(&target, ServerEvent::ChannelCreated(channel.clone()), None).await;

        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text() {
        assert_eq!(validate_text("name", "  ops  ", 10).unwrap(), "ops");
        assert_eq!(validate_text("name", "   ", 10).unwrap_err().code(), "invalid_command");
        assert!(validate_text("name", "ñññ", 3).is_ok());
        assert!(validate_text("name", "abcd", 3).is_err());
    }
}
