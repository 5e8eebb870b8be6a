//! In-memory chat store
//!
//! Hash maps behind a tokio `RwLock`. Used by tests and the demo server; it
//! also plays the identity provider so a whole gateway can run without SQLite.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::{StoreError, StoreResult};
use super::models::{
    Channel, ChannelMember, ChannelRole, Message, MessageView, NewChannel, NewMessage, Reaction,
    ReactionAction, ReplySummary, UserSummary,
};
use super::ChatStore;
use crate::identity::{Identity, IdentityResolver, TenantMembership};
use crate::types::{ChannelId, MessageId, TenantId, Timestamp, UserId};

#[derive(Default)]
struct State {
    users: HashMap<UserId, Identity>,
    sessions: HashMap<String, UserId>,
    memberships: HashMap<UserId, Vec<TenantMembership>>,
    channels: HashMap<ChannelId, Channel>,
    members: HashMap<ChannelId, BTreeMap<UserId, ChannelMember>>,
    messages: HashMap<MessageId, Message>,
    reactions: HashMap<MessageId, Vec<Reaction>>,
}

impl State {
    fn view(&self, id: &MessageId) -> StoreResult<Option<MessageView>> {
        let Some(message) = self.messages.get(id) else {
            return Ok(None);
        };

        let author = self
            .users
            .get(&message.author_id)
            .map(Identity::summary)
            .unwrap_or_else(|| UserSummary {
                id: message.author_id.clone(),
                display_name: message.author_id.to_string(),
                email: String::new(),
            });

        let reply_to = message
            .reply_to_id
            .as_ref()
            .and_then(|reply| self.messages.get(reply))
            .map(|parent| ReplySummary {
                id: parent.id.clone(),
                author_id: parent.author_id.clone(),
                content: parent.content.clone(),
            });

        Ok(Some(MessageView {
            id: message.id.clone(),
            channel_id: message.channel_id.clone(),
            author,
            content: message.content.clone(),
            reply_to,
            reactions: self.reactions.get(id).cloned().unwrap_or_default(),
            edited_at: message.edited_at,
            created_at: message.created_at,
        }))
    }
}

#[derive(Default)]
pub struct InMemoryChatStore {
    state: RwLock<State>,
    fail_writes: AtomicBool,
    fail_touch: AtomicBool,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating operation fail with [`StoreError::Unavailable`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only `touch_channel` fail
    pub fn set_fail_touch(&self, fail: bool) {
        self.fail_touch.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    // ===== Seeding =====

    pub async fn add_user(&self, identity: Identity) {
        self.state.write().await.users.insert(identity.user_id.clone(), identity);
    }

    pub async fn add_session(&self, token: &str, user: &UserId) {
        self.state.write().await.sessions.insert(token.to_string(), user.clone());
    }

    pub async fn add_membership(&self, user: &UserId, membership: TenantMembership) {
        self.state.write().await.memberships.entry(user.clone()).or_default().push(membership);
    }

    /// Insert a channel without any member rows
    pub async fn add_channel(&self, channel: Channel) {
        let mut state = self.state.write().await;
        state.members.entry(channel.id.clone()).or_default();
        state.channels.insert(channel.id.clone(), channel);
    }

    pub async fn add_channel_member(&self, channel: &ChannelId, user: &UserId, role: ChannelRole) {
        let member = ChannelMember {
            channel_id: channel.clone(),
            user_id: user.clone(),
            role,
            joined_at: Timestamp::now(),
        };
        self.state
            .write()
            .await
            .members
            .entry(channel.clone())
            .or_default()
            .insert(user.clone(), member);
    }

    pub async fn remove_channel_member(&self, channel: &ChannelId, user: &UserId) -> bool {
        let mut state = self.state.write().await;
        state.members.get_mut(channel).and_then(|m| m.remove(user)).is_some()
    }

    // ===== Inspection =====

    pub async fn channel(&self, id: &ChannelId) -> Option<Channel> {
        self.state.read().await.channels.get(id).cloned()
    }

    pub async fn channels_in(&self, tenant: &TenantId) -> Vec<Channel> {
        let state = self.state.read().await;
        let mut channels: Vec<_> =
            state.channels.values().filter(|c| &c.tenant_id == tenant).cloned().collect();
        channels.sort_by_key(|c| c.created_at);
        channels
    }

    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.state.read().await.messages.get(id).cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Channels `user` holds a membership row in
    pub async fn member_channels(&self, user: &UserId) -> HashSet<ChannelId> {
        let state = self.state.read().await;
        state
            .members
            .iter()
            .filter(|(_, members)| members.contains_key(user))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub async fn reactions(&self, id: &MessageId) -> Vec<Reaction> {
        self.state.read().await.reactions.get(id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn is_channel_member(
        &self,
        tenant: &TenantId,
        channel: &ChannelId,
        user: &UserId,
    ) -> StoreResult<bool> {
        let state = self.state.read().await;
        let in_tenant = state.channels.get(channel).is_some_and(|c| &c.tenant_id == tenant);
        Ok(in_tenant && state.members.get(channel).is_some_and(|m| m.contains_key(user)))
    }

    async fn create_channel(&self, new: NewChannel) -> StoreResult<Channel> {
        self.check_writable()?;
        let now = Timestamp::now();
        let channel = Channel {
            id: ChannelId::generate(),
            tenant_id: new.tenant_id,
            name: new.name,
            description: new.description,
            is_private: new.is_private,
            created_by: new.creator.clone(),
            created_at: now,
            last_activity_at: now,
        };

        let owner = ChannelMember {
            channel_id: channel.id.clone(),
            user_id: new.creator.clone(),
            role: ChannelRole::Owner,
            joined_at: now,
        };

        let mut state = self.state.write().await;
        state.members.insert(channel.id.clone(), BTreeMap::from([(new.creator, owner)]));
        state.channels.insert(channel.id.clone(), channel.clone());
        Ok(channel)
    }

    async fn channel_members(&self, channel: &ChannelId) -> StoreResult<Vec<ChannelMember>> {
        let state = self.state.read().await;
        let mut members: Vec<_> =
            state.members.get(channel).map(|m| m.values().cloned().collect()).unwrap_or_default();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(members)
    }

    async fn get_message(&self, tenant: &TenantId, message: &MessageId) -> StoreResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(message)
            .filter(|m| state.channels.get(&m.channel_id).is_some_and(|c| &c.tenant_id == tenant))
            .cloned())
    }

    async fn insert_message(&self, new: NewMessage) -> StoreResult<MessageView> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.channels.contains_key(&new.channel_id) {
            return Err(StoreError::Corrupt(format!("channel {} does not exist", new.channel_id)));
        }

        let message = Message {
            id: MessageId::generate(),
            channel_id: new.channel_id,
            author_id: new.author_id,
            content: new.content,
            reply_to_id: new.reply_to_id,
            edited_at: None,
            created_at: Timestamp::now(),
        };
        let id = message.id.clone();
        state.messages.insert(id.clone(), message);

        state.view(&id)?.ok_or_else(|| StoreError::Corrupt(format!("message {} vanished", id)))
    }

    async fn update_message_content(
        &self,
        message: &MessageId,
        content: &str,
        edited_at: Timestamp,
    ) -> StoreResult<Option<MessageView>> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let Some(row) = state.messages.get_mut(message) else {
            return Ok(None);
        };
        row.content = content.to_string();
        row.edited_at = Some(edited_at);
        state.view(message)
    }

    async fn delete_message(&self, message: &MessageId) -> StoreResult<bool> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let removed = state.messages.remove(message).is_some();
        if removed {
            state.reactions.remove(message);
            for row in state.messages.values_mut() {
                if row.reply_to_id.as_ref() == Some(message) {
                    row.reply_to_id = None;
                }
            }
        }
        Ok(removed)
    }

    async fn toggle_reaction(
        &self,
        message: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> StoreResult<ReactionAction> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.messages.contains_key(message) {
            return Err(StoreError::Missing(format!("message {}", message)));
        }

        let reactions = state.reactions.entry(message.clone()).or_default();
        let before = reactions.len();
        reactions.retain(|r| !(&r.user_id == user && r.emoji == emoji));

        if reactions.len() < before {
            return Ok(ReactionAction::Remove);
        }

        reactions.push(Reaction {
            user_id: user.clone(),
            emoji: emoji.to_string(),
            created_at: Timestamp::now(),
        });
        Ok(ReactionAction::Add)
    }

    async fn touch_channel(&self, channel: &ChannelId, at: Timestamp) -> StoreResult<()> {
        self.check_writable()?;
        if self.fail_touch.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("touch disabled".to_string()));
        }
        if let Some(row) = self.state.write().await.channels.get_mut(channel) {
            row.last_activity_at = at;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityResolver for InMemoryChatStore {
    async fn resolve_session(&self, token: &str) -> StoreResult<Option<Identity>> {
        let state = self.state.read().await;
        Ok(state.sessions.get(token).and_then(|user| state.users.get(user)).cloned())
    }

    async fn memberships(&self, user: &UserId) -> StoreResult<Vec<TenantMembership>> {
        let state = self.state.read().await;
        let mut memberships = state.memberships.get(user).cloned().unwrap_or_default();
        memberships.sort_by_key(|m| m.joined_at);
        Ok(memberships)
    }
}
