//! Wire protocol
//!
//! Commands arrive as `{"type": "<command>", "data": {...}}` and events leave
//! as `{"event": "<event>", "data": {...}}`. Both are closed sum types, so
//! adding a command is a compile-checked change to the dispatch table.

use serde::{Deserialize, Serialize};

use crate::errors::{RealtimeError, RealtimeResult};
use crate::persistence::{Channel, MessageView, ReactionAction, UserSummary};
use crate::types::{ChannelId, MessageId, Timestamp, UserId};

/// Aggregate presence of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    /// Derived from the last connection closing; clients cannot claim it
    #[serde(skip_deserializing)]
    Offline,
}

/// Commands a client may issue, always scoped to its own tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "channel:join", rename_all = "camelCase")]
    JoinChannel { channel_id: ChannelId },

    #[serde(rename = "channel:leave", rename_all = "camelCase")]
    LeaveChannel { channel_id: ChannelId },

    #[serde(rename = "channel:create", rename_all = "camelCase")]
    CreateChannel {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        is_private: bool,
    },

    #[serde(rename = "message:send", rename_all = "camelCase")]
    SendMessage {
        channel_id: ChannelId,
        content: String,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },

    #[serde(rename = "message:edit", rename_all = "camelCase")]
    EditMessage { message_id: MessageId, content: String },

    #[serde(rename = "message:delete", rename_all = "camelCase")]
    DeleteMessage { message_id: MessageId },

    #[serde(rename = "message:react", rename_all = "camelCase")]
    React { message_id: MessageId, emoji: String },

    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { channel_id: ChannelId },

    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { channel_id: ChannelId },

    #[serde(rename = "presence:update")]
    UpdatePresence { status: PresenceStatus },
}

impl ClientCommand {
    /// Parse a text frame. Malformed frames are the caller's fault.
    pub fn decode(frame: &str) -> RealtimeResult<Self> {
        serde_json::from_str(frame).map_err(|e| RealtimeError::InvalidCommand(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinChannel { .. } => "channel:join",
            ClientCommand::LeaveChannel { .. } => "channel:leave",
            ClientCommand::CreateChannel { .. } => "channel:create",
            ClientCommand::SendMessage { .. } => "message:send",
            ClientCommand::EditMessage { .. } => "message:edit",
            ClientCommand::DeleteMessage { .. } => "message:delete",
            ClientCommand::React { .. } => "message:react",
            ClientCommand::TypingStart { .. } => "typing:start",
            ClientCommand::TypingStop { .. } => "typing:stop",
            ClientCommand::UpdatePresence { .. } => "presence:update",
        }
    }
}

/// Payload of `user:joined`, `user:left` and `user:presence`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
    pub display_name: String,
    pub status: PresenceStatus,
    /// Last seen
    pub timestamp: Timestamp,
}

/// Events pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(MessageView),

    #[serde(rename = "message:updated")]
    MessageUpdated(MessageView),

    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted { message_id: MessageId },

    #[serde(rename = "message:reaction", rename_all = "camelCase")]
    MessageReaction {
        message_id: MessageId,
        channel_id: ChannelId,
        user_id: UserId,
        emoji: String,
        action: ReactionAction,
    },

    #[serde(rename = "channel:joined", rename_all = "camelCase")]
    ChannelJoined { channel_id: ChannelId, user: UserSummary },

    #[serde(rename = "channel:left", rename_all = "camelCase")]
    ChannelLeft { channel_id: ChannelId, user: UserSummary },

    #[serde(rename = "channel:created")]
    ChannelCreated(Channel),

    #[serde(rename = "typing:indicator", rename_all = "camelCase")]
    TypingIndicator { channel_id: ChannelId, user_id: UserId, is_typing: bool },

    #[serde(rename = "user:joined")]
    UserJoined(PresenceNotice),

    #[serde(rename = "user:left")]
    UserLeft(PresenceNotice),

    #[serde(rename = "user:presence")]
    UserPresence(PresenceNotice),

    #[serde(rename = "domain:event", rename_all = "camelCase")]
    DomainEvent { event_type: String, payload: serde_json::Value, timestamp: Timestamp },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageNew(_) => "message:new",
            ServerEvent::MessageUpdated(_) => "message:updated",
            ServerEvent::MessageDeleted { .. } => "message:deleted",
            ServerEvent::MessageReaction { .. } => "message:reaction",
            ServerEvent::ChannelJoined { .. } => "channel:joined",
            ServerEvent::ChannelLeft { .. } => "channel:left",
            ServerEvent::ChannelCreated(_) => "channel:created",
            ServerEvent::TypingIndicator { .. } => "typing:indicator",
            ServerEvent::UserJoined(_) => "user:joined",
            ServerEvent::UserLeft(_) => "user:left",
            ServerEvent::UserPresence(_) => "user:presence",
            ServerEvent::DomainEvent { .. } => "domain:event",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Caller-scoped error event
    pub fn error(err: &RealtimeError) -> Self {
        ServerEvent::Error { message: err.client_message(), code: Some(err.code().to_string()) }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join() {
        let cmd = ClientCommand::decode(r#"{"type":"channel:join","data":{"channelId":"c1"}}"#).unwrap();
        assert_eq!(cmd, ClientCommand::JoinChannel { channel_id: ChannelId::new("c1") });
        assert_eq!(cmd.name(), "channel:join");
    }

    #[test]
    fn test_decode_optional_fields() {
        let cmd = ClientCommand::decode(r#"{"type":"channel:create","data":{"name":"ops"}}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::CreateChannel { name: "ops".into(), description: None, is_private: false }
        );

        let cmd = ClientCommand::decode(
            r#"{"type":"message:send","data":{"channelId":"c","content":"hi","replyTo":"m0"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::SendMessage {
                channel_id: ChannelId::new("c"),
                content: "hi".into(),
                reply_to: Some(MessageId::new("m0")),
            }
        );
    }

    #[test]
    fn test_presence_offline_is_not_a_client_status() {
        let ok = ClientCommand::decode(r#"{"type":"presence:update","data":{"status":"busy"}}"#).unwrap();
        assert_eq!(ok, ClientCommand::UpdatePresence { status: PresenceStatus::Busy });

        let err = ClientCommand::decode(r#"{"type":"presence:update","data":{"status":"offline"}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_command");
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        assert!(ClientCommand::decode(r#"{"type":"admin:nuke","data":{}}"#).is_err());
        assert!(ClientCommand::decode("not json").is_err());
        assert!(ClientCommand::decode(r#"{"type":"message:edit","data":{"messageId":"m"}}"#).is_err());
    }

    #[test]
    fn test_typing_event_shape() {
        let event = ServerEvent::TypingIndicator {
            channel_id: ChannelId::new("c"),
            user_id: UserId::new("u"),
            is_typing: true,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "typing:indicator", "data": {"channelId": "c", "userId": "u", "isTyping": true}})
        );
    }

    #[test]
    fn test_error_event_shape() {
        let event = ServerEvent::error(&RealtimeError::access_denied());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "error", "data": {"message": "channel access denied", "code": "forbidden"}})
        );

        let bare: ServerEvent =
            serde_json::from_value(json!({"event": "error", "data": {"message": "x"}})).unwrap();
        assert_eq!(bare, ServerEvent::Error { message: "x".into(), code: None });
    }

    #[test]
    fn test_reaction_event_shape() {
        let event = ServerEvent::MessageReaction {
            message_id: MessageId::new("m"),
            channel_id: ChannelId::new("c"),
            user_id: UserId::new("u"),
            emoji: "👍".into(),
            action: ReactionAction::Remove,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "message:reaction");
        assert_eq!(value["data"]["action"], "remove");
        assert_eq!(value["data"]["messageId"], "m");
    }
}
