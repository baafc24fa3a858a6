use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A device identity. Born on the first `hello_device`, never destroyed.
/// The public key is opaque to the gateway — it is relayed to peers for
/// DM envelope encryption and never interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: Uuid,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A claimed alias. `active_session_id` is `None` while the alias is idle;
/// `reclaim_nonce` rotates on every successful claim and is required to
/// re-take an idle alias from a different device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasRecord {
    pub alias: String,
    pub current_device_id: Uuid,
    pub active_session_id: Option<Uuid>,
    pub last_ip: String,
    pub claimed_at: DateTime<Utc>,
    pub reclaim_nonce: String,
}

/// One row per connection. The row persists after disconnect with
/// `disconnected_at` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub device_id: Uuid,
    pub alias: Option<String>,
    pub ip: String,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub resume_token: String,
}

/// Channel mode flags, serialized as the classical flag strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelMode {
    #[serde(rename = "+i")]
    InviteOnly,
    #[serde(rename = "+m")]
    Moderated,
    #[serde(rename = "+n")]
    NoExternal,
    #[serde(rename = "+t")]
    TopicLocked,
    #[serde(rename = "+k")]
    Keyed,
    #[serde(rename = "+l")]
    Limited,
}

impl ChannelMode {
    /// Parse the letter part of a `+X` / `-X` mode change.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'i' => Some(Self::InviteOnly),
            'm' => Some(Self::Moderated),
            'n' => Some(Self::NoExternal),
            't' => Some(Self::TopicLocked),
            'k' => Some(Self::Keyed),
            'l' => Some(Self::Limited),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::InviteOnly => "+i",
            Self::Moderated => "+m",
            Self::NoExternal => "+n",
            Self::TopicLocked => "+t",
            Self::Keyed => "+k",
            Self::Limited => "+l",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: Uuid,
    pub name: String,
    pub topic: String,
    pub modes: BTreeSet<ChannelMode>,
    pub owner_alias: String,
    pub created_at: DateTime<Utc>,
}

/// Channel role lattice. The derived `Ord` gives the strict total order
/// MEMBER < VOICE < OP < ADMIN < OWNER used by every capability check.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Member,
    Voice,
    Op,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "MEMBER",
            Self::Voice => "VOICE",
            Self::Op => "OP",
            Self::Admin => "ADMIN",
            Self::Owner => "OWNER",
        }
    }
}

/// Membership row keyed by `(channel, alias)`. A banned member keeps the row
/// but is filtered from presence, fan-out and name listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub muted_until: Option<DateTime<Utc>>,
    pub is_banned: bool,
}

/// Two-party DM scope. Invariant: `alias_a < alias_b` lexicographically,
/// and `convo_id` is derived from the sorted pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmConversation {
    pub convo_id: String,
    pub alias_a: String,
    pub alias_b: String,
    pub created_at: DateTime<Utc>,
}

impl DmConversation {
    /// Deterministic conversation id for an alias pair, in either order.
    /// `|` cannot appear in a validated alias, so the id is unambiguous.
    pub fn convo_id_for(a: &str, b: &str) -> String {
        if a <= b {
            format!("{a}|{b}")
        } else {
            format!("{b}|{a}")
        }
    }

    pub fn involves(&self, alias: &str) -> bool {
        self.alias_a == alias || self.alias_b == alias
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Action,
    Notice,
}

/// Where a message lives: a channel, a DM conversation, or a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Scope {
    Channel {
        channel: String,
    },
    Dm {
        #[serde(rename = "convoId")]
        convo_id: String,
    },
    Thread {
        #[serde(rename = "threadId")]
        thread_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl Scope {
    /// The channel a scope broadcasts into, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Channel { channel } => Some(channel),
            Self::Thread { channel, .. } => channel.as_deref(),
            Self::Dm { .. } => None,
        }
    }
}

/// The opaque end-to-end-encrypted DM envelope. The gateway relays these
/// fields verbatim and never inspects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub algorithm: String,
    pub nonce: String,
    pub ciphertext: String,
    pub sender_public_key: String,
    pub recipient_encrypted_key: String,
    pub sender_encrypted_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub aliases: Vec<String>,
}

/// A message record. Exactly one of `body` / `encrypted_payload` is present:
/// DM-scope rows carry the envelope, channel and thread rows carry plaintext.
/// `deleted_at` is a tombstone — the row stays for audit but is excluded
/// from history, search and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: Uuid,
    pub scope: Scope,
    pub sender_alias: String,
    pub sender_device_id: Uuid,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<EncryptedEnvelope>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub reactions: Vec<Reaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationKind {
    Kick,
    Ban,
    Unban,
    Mute,
    Unmute,
    RoleSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationAction {
    pub action_id: Uuid,
    pub actor_alias: String,
    pub target_alias: String,
    pub channel: String,
    pub action_type: ModerationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotApp {
    pub bot_id: String,
    pub name: String,
    pub version: String,
    pub permissions: Vec<String>,
    pub enabled_channels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub category: String,
    pub actor: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_lattice_is_strictly_ordered() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::Op);
        assert!(Role::Op > Role::Voice);
        assert!(Role::Voice > Role::Member);
    }

    #[test]
    fn convo_id_is_order_independent() {
        assert_eq!(
            DmConversation::convo_id_for("beta", "alpha"),
            DmConversation::convo_id_for("alpha", "beta"),
        );
        assert_eq!(DmConversation::convo_id_for("alpha", "beta"), "alpha|beta");
    }

    #[test]
    fn scope_serializes_with_kind_tag() {
        let scope = Scope::Channel {
            channel: "#lobby".into(),
        };
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["kind"], "channel");
        assert_eq!(json["channel"], "#lobby");

        let dm = Scope::Dm {
            convo_id: "a|b".into(),
        };
        let json = serde_json::to_value(&dm).unwrap();
        assert_eq!(json["kind"], "dm");
        assert_eq!(json["convoId"], "a|b");
    }

    #[test]
    fn channel_mode_round_trips_as_flag_string() {
        let mut modes = BTreeSet::new();
        modes.insert(ChannelMode::Moderated);
        let json = serde_json::to_string(&modes).unwrap();
        assert_eq!(json, r#"["+m"]"#);
        let back: BTreeSet<ChannelMode> = serde_json::from_str(&json).unwrap();
        assert!(back.contains(&ChannelMode::Moderated));
    }

    #[test]
    fn message_omits_absent_payload_side() {
        let msg = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: Scope::Channel {
                channel: "#lobby".into(),
            },
            sender_alias: "alpha".into(),
            sender_device_id: Uuid::new_v4(),
            kind: MessageKind::Text,
            body: Some("hi".into()),
            encrypted_payload: None,
            timestamp: Utc::now(),
            reply_to: None,
            thread_id: None,
            reactions: vec![],
            deleted_at: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("encryptedPayload").is_none());
        assert_eq!(json["body"], "hi");
    }
}
