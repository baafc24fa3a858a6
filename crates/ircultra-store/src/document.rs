use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ircultra_types::models::{
    AliasRecord, AuditEvent, BotApp, Channel, Device, DmConversation, Membership,
    MessageRecord, ModerationAction, SessionRecord,
};

/// The persisted state. One JSON object, full-document rewrites.
///
/// `channel_members` is a two-level map `{channel: {alias: Membership}}`;
/// `messages` is a flat array whose order is the insertion order.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateDocument {
    pub devices: HashMap<Uuid, Device>,
    pub aliases: HashMap<String, AliasRecord>,
    pub sessions: HashMap<Uuid, SessionRecord>,
    pub channels: HashMap<String, Channel>,
    pub channel_members: HashMap<String, HashMap<String, Membership>>,
    pub dm_conversations: HashMap<String, DmConversation>,
    pub messages: Vec<MessageRecord>,
    pub moderation_actions: Vec<ModerationAction>,
    pub bot_apps: Vec<BotApp>,
    pub audit_events: Vec<AuditEvent>,
}

impl StateDocument {
    /// Seed the default `echo` bot when none exist.
    pub fn seed_bots(&mut self) -> bool {
        if !self.bot_apps.is_empty() {
            return false;
        }
        self.bot_apps.push(BotApp {
            bot_id: "echo".into(),
            name: "Echo".into(),
            version: "1.0.0".into(),
            permissions: vec!["send_notice".into()],
            enabled_channels: vec![],
            created_at: Utc::now(),
        });
        true
    }
}
