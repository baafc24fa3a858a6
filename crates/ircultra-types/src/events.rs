use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    DmConversation, EncryptedEnvelope, MessageKind, MessageRecord, ModerationKind, Role, Scope,
};

/// Events sent FROM client TO gateway. Each wire frame is a JSON object
/// `{event, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Device handshake. Must be the first event on a connection.
    #[serde(rename_all = "camelCase")]
    HelloDevice {
        device_id: Option<Uuid>,
        device_public_key: String,
    },

    /// Claim (or reclaim) an alias for this session.
    #[serde(rename_all = "camelCase")]
    ClaimAlias {
        alias: String,
        reclaim_nonce: Option<String>,
    },

    /// Execute raw input: slash commands, or plain channel text otherwise.
    #[serde(rename_all = "camelCase")]
    CommandExec {
        raw: String,
        context_channel: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    JoinChannel { channel: String },

    #[serde(rename_all = "camelCase")]
    PartChannel {
        channel: String,
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SendChannelMessage {
        channel: String,
        body: String,
        kind: Option<MessageKind>,
        reply_to: Option<Uuid>,
        thread_id: Option<String>,
    },

    /// End-to-end-encrypted direct message. The envelope is opaque bytes
    /// plus metadata — relayed, never inspected.
    #[serde(rename_all = "camelCase")]
    SendDmMessage {
        target_alias: String,
        encrypted_payload: EncryptedEnvelope,
    },

    #[serde(rename_all = "camelCase")]
    ReactToggle { message_id: Uuid, emoji: String },

    #[serde(rename_all = "camelCase")]
    MessageEdit { message_id: Uuid, body: String },

    #[serde(rename_all = "camelCase")]
    MessageDelete { message_id: Uuid },

    #[serde(rename_all = "camelCase")]
    HistoryFetch {
        scope: Scope,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    },

    #[serde(rename_all = "camelCase")]
    TypingState { scope: Scope, active: bool },

    #[serde(rename_all = "camelCase")]
    BotInvoke {
        bot_id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        channel: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelEventType {
    Created,
    Joined,
    Parted,
    TopicChanged,
    ModeChanged,
    Invited,
    Kicked,
    MemberUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageEventType {
    Created,
    Edited,
    Deleted,
    ReactionAdded,
    ReactionRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    AliasInUse,
    AliasInvalid,
    ChannelNotFound,
    Forbidden,
    RateLimit,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// One channel's summary inside a `network_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub name: String,
    pub topic: String,
    pub modes: Vec<String>,
    pub member_count: usize,
    pub owner_alias: String,
}

/// The caller's membership rows inside a `network_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSummary {
    pub channel: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// Events sent FROM gateway TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    SessionReady {
        device_id: Uuid,
        alias: Option<String>,
        resume_token: String,
        motd: String,
    },

    #[serde(rename_all = "camelCase")]
    AliasResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reclaim_nonce: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_key: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    NetworkSnapshot {
        channels: Vec<ChannelSummary>,
        dms: Vec<DmConversation>,
        memberships: Vec<MembershipSummary>,
        unread_counters: HashMap<String, u64>,
    },

    #[serde(rename_all = "camelCase")]
    ChannelEvent {
        #[serde(rename = "type")]
        event_type: ChannelEventType,
        channel: String,
        actor: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    MessageEvent {
        #[serde(rename = "type")]
        event_type: MessageEventType,
        scope: Scope,
        message: MessageRecord,
    },

    #[serde(rename_all = "camelCase")]
    PresenceEvent {
        alias: String,
        status: PresenceStatus,
        channels: Vec<String>,
        public_key: String,
        color: String,
    },

    #[serde(rename_all = "camelCase")]
    ModerationEvent {
        action: ModerationKind,
        actor: String,
        target: String,
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    BotEvent {
        bot_id: String,
        channel: String,
        output: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    HistorySnapshot {
        scope: Scope,
        messages: Vec<MessageRecord>,
    },

    #[serde(rename_all = "camelCase")]
    ServerError { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// The sender alias when this is a freshly created message, used by the
    /// hub's ignore filter. Other event kinds pass through unfiltered.
    pub fn created_message_sender(&self) -> Option<&str> {
        match self {
            Self::MessageEvent {
                event_type: MessageEventType::Created,
                message,
                ..
            } => Some(message.sender_alias.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_decodes_from_wire_shape() {
        let raw = r#"{"event":"claim_alias","payload":{"alias":"Alpha","reclaimNonce":"n1"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::ClaimAlias {
                alias,
                reclaim_nonce,
            } => {
                assert_eq!(alias, "Alpha");
                assert_eq!(reclaim_nonce.as_deref(), Some("n1"));
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn hello_device_allows_missing_device_id() {
        let raw = r#"{"event":"hello_device","payload":{"devicePublicKey":"K1"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::HelloDevice {
                device_id,
                device_public_key,
            } => {
                assert!(device_id.is_none());
                assert_eq!(device_public_key, "K1");
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn server_error_serializes_event_and_code() {
        let event = ServerEvent::error(ErrorCode::RateLimit, "slow down");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "server_error");
        assert_eq!(json["payload"]["code"], "RATE_LIMIT");
    }

    #[test]
    fn channel_event_uses_type_field() {
        let event = ServerEvent::ChannelEvent {
            event_type: ChannelEventType::TopicChanged,
            channel: "#lobby".into(),
            actor: "alpha".into(),
            payload: serde_json::json!({"topic": "hello"}),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "TOPIC_CHANGED");
    }
}
