//! Message mutation pipeline
//!
//! Each operation validates against the store, writes through, then fans the
//! result out to the channel room of the affected message. A failed write
//! reaches the sender only; nothing is broadcast.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RealtimeConfig;
use crate::errors::{RealtimeError, RealtimeResult};
use crate::fanout::Fanout;
use crate::membership::validate_text;
use crate::persistence::{ChatStore, Message, MessageView, NewMessage, ReactionAction, StoreError};
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionContext, Room};
use crate::types::{ChannelId, MessageId, Timestamp};

pub struct MessagePipeline {
    store: Arc<dyn ChatStore>,
    fanout: Fanout,
    config: RealtimeConfig,
}

impl MessagePipeline {
    pub fn new(store: Arc<dyn ChatStore>, fanout: Fanout, config: RealtimeConfig) -> Self {
        Self { store, fanout, config }
    }

    fn validate_content(&self, content: &str) -> RealtimeResult<String> {
        if content.trim().is_empty() {
            return Err(RealtimeError::InvalidCommand("content must not be empty".to_string()));
        }
        if content.chars().count() > self.config.max_message_length {
            return Err(RealtimeError::InvalidCommand(format!(
                "content exceeds {} characters",
                self.config.max_message_length
            )));
        }
        Ok(content.to_string())
    }

    async fn require_membership(&self, ctx: &ConnectionContext, channel: &ChannelId) -> RealtimeResult<()> {
        if self.store.is_channel_member(&ctx.tenant_id, channel, ctx.user_id()).await? {
            Ok(())
        } else {
            Err(RealtimeError::access_denied())
        }
    }

    async fn load(&self, ctx: &ConnectionContext, id: &MessageId) -> RealtimeResult<Message> {
        self.store
            .get_message(&ctx.tenant_id, id)
            .await?
            .ok_or_else(|| RealtimeError::NotFound("message".to_string()))
    }

    async fn load_owned(&self, ctx: &ConnectionContext, id: &MessageId, action: &str) -> RealtimeResult<Message> {
        let message = self.load(ctx, id).await?;
        if &message.author_id != ctx.user_id() {
            debug!(message_id = %id, user_id = %ctx.user_id(), action, "Not the author");
            return Err(RealtimeError::Authorization(format!(
                "only the author can {} this message",
                action
            )));
        }
        Ok(message)
    }

    pub async fn send(
        &self,
        ctx: &ConnectionContext,
        channel: &ChannelId,
        content: &str,
        reply_to: Option<&MessageId>,
    ) -> RealtimeResult<MessageView> {
        let content = self.validate_content(content)?;
        self.require_membership(ctx, channel).await?;

        if let Some(parent) = reply_to {
            let parent = self.load(ctx, parent).await?;
            if &parent.channel_id != channel {
                return Err(RealtimeError::NotFound("message".to_string()));
            }
        }

        let view = self
            .store
            .insert_message(NewMessage {
                channel_id: channel.clone(),
                author_id: ctx.user_id().clone(),
                content,
                reply_to_id: reply_to.cloned(),
            })
            .await?;

        let room = Room::channel(&ctx.tenant_id, channel);
        self.fanout.to_room(&room, ServerEvent::MessageNew(view.clone()), None).await;

        if let Err(e) = self.store.touch_channel(channel, view.created_at).await {
            warn!(channel_id = %channel, error = %e, "Failed to record channel activity");
        }

        Ok(view)
    }

    pub async fn edit(&self, ctx: &ConnectionContext, id: &MessageId, content: &str) -> RealtimeResult<MessageView> {
        let message = self.load_owned(ctx, id, "edit").await?;
        let content = self.validate_content(content)?;

        let view = self
            .store
            .update_message_content(id, &content, Timestamp::now())
            .await?
            .ok_or_else(|| RealtimeError::NotFound("message".to_string()))?;

        let room = Room::channel(&ctx.tenant_id, &message.channel_id);
        self.fanout.to_room(&room, ServerEvent::MessageUpdated(view.clone()), None).await;
        Ok(view)
    }

    pub async fn delete(&self, ctx: &ConnectionContext, id: &MessageId) -> RealtimeResult<()> {
        let message = self.load_owned(ctx, id, "delete").await?;

        if !self.store.delete_message(id).await? {
            return Err(RealtimeError::NotFound("message".to_string()));
        }

        let room = Room::channel(&ctx.tenant_id, &message.channel_id);
        self.fanout.to_room(&room, ServerEvent::MessageDeleted { message_id: id.clone() }, None).await;
        Ok(())
    }

    /// Toggle `(message, caller, emoji)`. The message's channel is loaded
    /// explicitly so the broadcast always reaches the right room.
    pub async fn react(&self, ctx: &ConnectionContext, id: &MessageId, emoji: &str) -> RealtimeResult<ReactionAction> {
        let emoji = validate_text("emoji", emoji, self.config.max_emoji_length)?;
        let message = self.load(ctx, id).await?;
        self.require_membership(ctx, &message.channel_id).await?;

        // Deleted since it was loaded
        let action = match self.store.toggle_reaction(id, ctx.user_id(), &emoji).await {
            Ok(action) => action,
            Err(StoreError::Missing(_)) => return Err(RealtimeError::NotFound("message".to_string())),
            Err(e) => return Err(e.into()),
        };

        let event = ServerEvent::MessageReaction {
            message_id: id.clone(),
            channel_id: message.channel_id.clone(),
            user_id: ctx.user_id().clone(),
            emoji,
            action,
        };
        let room = Room::channel(&ctx.tenant_id, &message.channel_id);
        self.fanout.to_room(&room, event, None).await;
        Ok(action)
    }
}
