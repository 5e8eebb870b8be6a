//! Rows owned by the persistence layer and the views built from them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{ChannelId, MessageId, TenantId, Timestamp, UserId};

/// Role of a persisted channel member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Owner,
    Admin,
    Member,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Owner => "owner",
            ChannelRole::Admin => "admin",
            ChannelRole::Member => "member",
        }
    }

    /// Owners and admins may manage the channel
    pub fn is_elevated(&self) -> bool {
        matches!(self, ChannelRole::Owner | ChannelRole::Admin)
    }
}

impl FromStr for ChannelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(ChannelRole::Owner),
            "admin" => Ok(ChannelRole::Admin),
            "member" => Ok(ChannelRole::Member),
            other => Err(format!("unknown channel role '{}'", other)),
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub last_activity_at: Timestamp,
}

/// Input for [`super::ChatStore::create_channel`]
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub creator: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub role: ChannelRole,
    pub joined_at: Timestamp,
}

/// A stored message row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub reply_to_id: Option<MessageId>,
    pub edited_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub reply_to_id: Option<MessageId>,
}

/// Public face of a user, embedded in events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySummary {
    pub id: MessageId,
    pub author_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: Timestamp,
}

/// A message with author, reply target and reactions loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: UserSummary,
    pub content: String,
    pub reply_to: Option<ReplySummary>,
    pub reactions: Vec<Reaction>,
    pub edited_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// Outcome of a reaction toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}
