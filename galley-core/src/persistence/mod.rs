//! Persistence layer interface
//!
//! The relational store is the single source of truth for channels,
//! memberships, messages and reactions. The collaboration core only talks to
//! it through [`ChatStore`]; every authorization decision re-reads it.
//!
//! Two implementations ship with the crate:
//! - [`SqliteStore`]: rusqlite behind an r2d2 pool
//! - [`InMemoryChatStore`]: hash maps, for tests and demos

use async_trait::async_trait;

use crate::types::{ChannelId, MessageId, TenantId, Timestamp, UserId};

mod error;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryChatStore;
pub use models::{
    Channel, ChannelMember, ChannelRole, Message, MessageView, NewChannel, NewMessage, Reaction,
    ReactionAction, ReplySummary, UserSummary,
};
pub use sqlite::SqliteStore;

/// Operations the collaboration core needs from the relational store
///
/// Implementations must make `create_channel` and `toggle_reaction` atomic.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// True iff `user` holds a membership row for `channel` and the channel
    /// belongs to `tenant`
    async fn is_channel_member(
        &self,
        tenant: &TenantId,
        channel: &ChannelId,
        user: &UserId,
    ) -> StoreResult<bool>;

    /// Persist a channel plus exactly one `owner` membership for the creator
    async fn create_channel(&self, channel: NewChannel) -> StoreResult<Channel>;

    async fn channel_members(&self, channel: &ChannelId) -> StoreResult<Vec<ChannelMember>>;

    /// Load a message, scoped to `tenant` through its channel
    async fn get_message(
        &self,
        tenant: &TenantId,
        message: &MessageId,
    ) -> StoreResult<Option<Message>>;

    /// Persist a message and return it with relations loaded
    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessageView>;

    /// Replace content and set the edited timestamp. `None` if the row is gone.
    async fn update_message_content(
        &self,
        message: &MessageId,
        content: &str,
        edited_at: Timestamp,
    ) -> StoreResult<Option<MessageView>>;

    /// Hard delete. Returns false if the row was already gone.
    async fn delete_message(&self, message: &MessageId) -> StoreResult<bool>;

    /// Flip set membership of `(message, user, emoji)`
    async fn toggle_reaction(
        &self,
        message: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> StoreResult<ReactionAction>;

    /// Record channel activity
    async fn touch_channel(&self, channel: &ChannelId, at: Timestamp) -> StoreResult<()>;
}
