use chrono::{Duration, Utc};
use uuid::Uuid;

use ircultra_types::models::{
    AliasRecord, AuditEvent, BotApp, Channel, ChannelMode, Device, DmConversation, Membership,
    MessageRecord, ModerationAction, ModerationKind, Role, Scope, SessionRecord,
};

use crate::Store;

/// Why an alias claim was refused. The dispatcher maps this to
/// `UNAUTHORIZED` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    /// The alias belongs to a different device and no matching reclaim
    /// nonce was supplied.
    NonceMismatch,
}

impl Store {
    // -- Devices & sessions --

    /// Create or refresh a device row. A known `device_id` reattaches the
    /// existing identity and refreshes `last_seen_at`.
    pub fn upsert_device(&self, device_id: Option<Uuid>, public_key: &str) -> Device {
        self.with_doc_mut(|doc| {
            let now = Utc::now();
            if let Some(id) = device_id {
                if let Some(device) = doc.devices.get_mut(&id) {
                    device.last_seen_at = now;
                    if !public_key.is_empty() {
                        device.public_key = public_key.to_string();
                    }
                    return device.clone();
                }
            }
            let device = Device {
                device_id: device_id.unwrap_or_else(Uuid::new_v4),
                public_key: public_key.to_string(),
                created_at: now,
                last_seen_at: now,
            };
            doc.devices.insert(device.device_id, device.clone());
            device
        })
    }

    pub fn device(&self, device_id: Uuid) -> Option<Device> {
        self.with_doc(|doc| doc.devices.get(&device_id).cloned())
    }

    /// Any alias currently mapped to this device, for `session_ready`.
    pub fn alias_for_device(&self, device_id: Uuid) -> Option<String> {
        self.with_doc(|doc| {
            doc.aliases
                .values()
                .find(|rec| rec.current_device_id == device_id)
                .map(|rec| rec.alias.clone())
        })
    }

    pub fn create_session(&self, session_id: Uuid, device_id: Uuid, ip: &str) -> SessionRecord {
        self.with_doc_mut(|doc| {
            let session = SessionRecord {
                session_id,
                device_id,
                alias: None,
                ip: ip.to_string(),
                connected_at: Utc::now(),
                disconnected_at: None,
                resume_token: Uuid::new_v4().to_string(),
            };
            doc.sessions.insert(session.session_id, session.clone());
            session
        })
    }

    pub fn session(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.with_doc(|doc| doc.sessions.get(&session_id).cloned())
    }

    /// Close the session row and release any alias it held. The row itself
    /// persists with `disconnected_at` set. Returns the released alias.
    pub fn close_session(&self, session_id: Uuid) -> Option<String> {
        self.with_doc_mut(|doc| {
            let session = doc.sessions.get_mut(&session_id)?;
            session.disconnected_at = Some(Utc::now());
            let alias = session.alias.take()?;
            if let Some(rec) = doc.aliases.get_mut(&alias) {
                if rec.active_session_id == Some(session_id) {
                    rec.active_session_id = None;
                }
            }
            Some(alias)
        })
    }

    // -- Aliases --

    /// Atomic alias claim. A different device may only take the alias with
    /// the record's current reclaim nonce; the same device always may. On
    /// success the nonce rotates and the session row is updated.
    pub fn claim_alias(
        &self,
        alias: &str,
        device_id: Uuid,
        session_id: Uuid,
        ip: &str,
        nonce: Option<&str>,
    ) -> Result<AliasRecord, ClaimError> {
        self.with_doc_mut(|doc| {
            let now = Utc::now();
            if let Some(rec) = doc.aliases.get(alias) {
                if rec.current_device_id != device_id
                    && nonce != Some(rec.reclaim_nonce.as_str())
                {
                    return Err(ClaimError::NonceMismatch);
                }
            }

            let rec = AliasRecord {
                alias: alias.to_string(),
                current_device_id: device_id,
                active_session_id: Some(session_id),
                last_ip: ip.to_string(),
                claimed_at: now,
                reclaim_nonce: Uuid::new_v4().to_string(),
            };
            doc.aliases.insert(alias.to_string(), rec.clone());

            if let Some(session) = doc.sessions.get_mut(&session_id) {
                session.alias = Some(alias.to_string());
            }
            Ok(rec)
        })
    }

    /// Mark the alias idle. The row is retained for reclaim.
    pub fn release_alias(&self, alias: &str) {
        self.with_doc_mut(|doc| {
            if let Some(rec) = doc.aliases.get_mut(alias) {
                rec.active_session_id = None;
            }
        });
    }

    pub fn alias_record(&self, alias: &str) -> Option<AliasRecord> {
        self.with_doc(|doc| doc.aliases.get(alias).cloned())
    }

    /// Detach an alias from a session row without closing the session
    /// (used when a session switches aliases via `/nick`).
    pub fn detach_session_alias(&self, session_id: Uuid) {
        self.with_doc_mut(|doc| {
            if let Some(session) = doc.sessions.get_mut(&session_id) {
                session.alias = None;
            }
        });
    }

    // -- Channels --

    /// Idempotent channel creation. The creator gets an OWNER membership.
    /// Returns the channel and whether it was created by this call.
    pub fn ensure_channel(&self, name: &str, owner_alias: &str) -> (Channel, bool) {
        self.with_doc_mut(|doc| {
            if let Some(channel) = doc.channels.get(name) {
                return (channel.clone(), false);
            }
            let now = Utc::now();
            let channel = Channel {
                channel_id: Uuid::new_v4(),
                name: name.to_string(),
                topic: String::new(),
                modes: Default::default(),
                owner_alias: owner_alias.to_string(),
                created_at: now,
            };
            doc.channels.insert(name.to_string(), channel.clone());
            doc.channel_members.entry(name.to_string()).or_default().insert(
                owner_alias.to_string(),
                Membership {
                    role: Role::Owner,
                    joined_at: now,
                    muted_until: None,
                    is_banned: false,
                },
            );
            (channel, true)
        })
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.with_doc(|doc| doc.channels.get(name).cloned())
    }

    pub fn list_channels(&self) -> Vec<Channel> {
        self.with_doc(|doc| {
            let mut channels: Vec<_> = doc.channels.values().cloned().collect();
            channels.sort_by(|a, b| a.name.cmp(&b.name));
            channels
        })
    }

    pub fn set_topic(&self, name: &str, topic: &str) -> Option<Channel> {
        self.with_doc_mut(|doc| {
            let channel = doc.channels.get_mut(name)?;
            channel.topic = topic.to_string();
            Some(channel.clone())
        })
    }

    /// Set or clear one mode flag; returns the resulting full mode set.
    pub fn toggle_mode(
        &self,
        name: &str,
        mode: ChannelMode,
        enable: bool,
    ) -> Option<Vec<ChannelMode>> {
        self.with_doc_mut(|doc| {
            let channel = doc.channels.get_mut(name)?;
            if enable {
                channel.modes.insert(mode);
            } else {
                channel.modes.remove(&mode);
            }
            Some(channel.modes.iter().copied().collect())
        })
    }

    // -- Memberships --

    /// Add a membership if absent (idempotent for an existing member).
    /// Joiners start as MEMBER; the creator's OWNER row is written by
    /// `ensure_channel`.
    pub fn upsert_membership(&self, channel: &str, alias: &str) -> Membership {
        self.with_doc_mut(|doc| {
            doc.channel_members
                .entry(channel.to_string())
                .or_default()
                .entry(alias.to_string())
                .or_insert_with(|| Membership {
                    role: Role::Member,
                    joined_at: Utc::now(),
                    muted_until: None,
                    is_banned: false,
                })
                .clone()
        })
    }

    pub fn part_membership(&self, channel: &str, alias: &str) -> bool {
        self.with_doc_mut(|doc| {
            doc.channel_members
                .get_mut(channel)
                .map(|members| members.remove(alias).is_some())
                .unwrap_or(false)
        })
    }

    pub fn membership(&self, channel: &str, alias: &str) -> Option<Membership> {
        self.with_doc(|doc| {
            doc.channel_members
                .get(channel)
                .and_then(|members| members.get(alias))
                .cloned()
        })
    }

    pub fn set_member_role(&self, channel: &str, alias: &str, role: Role) -> Option<Membership> {
        self.with_doc_mut(|doc| {
            let member = doc.channel_members.get_mut(channel)?.get_mut(alias)?;
            member.role = role;
            Some(member.clone())
        })
    }

    pub fn set_member_mute(
        &self,
        channel: &str,
        alias: &str,
        until: Option<chrono::DateTime<Utc>>,
    ) -> Option<Membership> {
        self.with_doc_mut(|doc| {
            let member = doc.channel_members.get_mut(channel)?.get_mut(alias)?;
            member.muted_until = until;
            Some(member.clone())
        })
    }

    pub fn set_member_ban(&self, channel: &str, alias: &str, banned: bool) -> Option<Membership> {
        self.with_doc_mut(|doc| {
            let member = doc.channel_members.get_mut(channel)?.get_mut(alias)?;
            member.is_banned = banned;
            Some(member.clone())
        })
    }

    /// Members of a channel, banned rows excluded, sorted by alias.
    pub fn channel_members(&self, channel: &str) -> Vec<(String, Membership)> {
        self.with_doc(|doc| {
            let mut members: Vec<_> = doc
                .channel_members
                .get(channel)
                .map(|m| {
                    m.iter()
                        .filter(|(_, member)| !member.is_banned)
                        .map(|(alias, member)| (alias.clone(), member.clone()))
                        .collect()
                })
                .unwrap_or_default();
            members.sort_by(|a, b| a.0.cmp(&b.0));
            members
        })
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.with_doc(|doc| {
            doc.channel_members
                .get(channel)
                .map(|m| m.values().filter(|member| !member.is_banned).count())
                .unwrap_or(0)
        })
    }

    pub fn memberships_for_alias(&self, alias: &str) -> Vec<(String, Membership)> {
        self.with_doc(|doc| {
            let mut rows: Vec<_> = doc
                .channel_members
                .iter()
                .filter_map(|(channel, members)| {
                    members
                        .get(alias)
                        .filter(|member| !member.is_banned)
                        .map(|member| (channel.clone(), member.clone()))
                })
                .collect();
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            rows
        })
    }

    // -- DM conversations --

    /// Deterministic lookup-or-create keyed by the sorted alias pair.
    pub fn get_or_create_dm_conversation(&self, a: &str, b: &str) -> DmConversation {
        self.with_doc_mut(|doc| {
            let convo_id = DmConversation::convo_id_for(a, b);
            doc.dm_conversations
                .entry(convo_id.clone())
                .or_insert_with(|| {
                    let (alias_a, alias_b) = if a <= b { (a, b) } else { (b, a) };
                    DmConversation {
                        convo_id,
                        alias_a: alias_a.to_string(),
                        alias_b: alias_b.to_string(),
                        created_at: Utc::now(),
                    }
                })
                .clone()
        })
    }

    pub fn dm_conversation(&self, convo_id: &str) -> Option<DmConversation> {
        self.with_doc(|doc| doc.dm_conversations.get(convo_id).cloned())
    }

    pub fn dm_conversations_for(&self, alias: &str) -> Vec<DmConversation> {
        self.with_doc(|doc| {
            let mut convos: Vec<_> = doc
                .dm_conversations
                .values()
                .filter(|convo| convo.involves(alias))
                .cloned()
                .collect();
            convos.sort_by(|a, b| a.convo_id.cmp(&b.convo_id));
            convos
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: MessageRecord) {
        self.with_doc_mut(|doc| doc.messages.push(message));
    }

    /// Fetch by id regardless of tombstone state (audit path).
    pub fn find_message(&self, message_id: Uuid) -> Option<MessageRecord> {
        self.with_doc(|doc| {
            doc.messages
                .iter()
                .find(|m| m.message_id == message_id)
                .cloned()
        })
    }

    /// Replace the body. Id, scope, sender, timestamp and reactions are
    /// untouched.
    pub fn edit_message(&self, message_id: Uuid, body: &str) -> Option<MessageRecord> {
        self.with_doc_mut(|doc| {
            let message = doc
                .messages
                .iter_mut()
                .find(|m| m.message_id == message_id)?;
            message.body = Some(body.to_string());
            Some(message.clone())
        })
    }

    /// Soft delete: set the tombstone, keep the row.
    pub fn delete_message(&self, message_id: Uuid) -> Option<MessageRecord> {
        self.with_doc_mut(|doc| {
            let message = doc
                .messages
                .iter_mut()
                .find(|m| m.message_id == message_id)?;
            message.deleted_at = Some(Utc::now());
            Some(message.clone())
        })
    }

    /// Toggle a `(emoji, alias)` reaction. Returns the updated record and
    /// `true` when the reaction was added, `false` when removed.
    pub fn toggle_reaction(
        &self,
        message_id: Uuid,
        alias: &str,
        emoji: &str,
    ) -> Option<(MessageRecord, bool)> {
        self.with_doc_mut(|doc| {
            let message = doc
                .messages
                .iter_mut()
                .find(|m| m.message_id == message_id)?;

            let added = match message.reactions.iter_mut().find(|r| r.emoji == emoji) {
                Some(reaction) => {
                    if let Some(pos) = reaction.aliases.iter().position(|a| a == alias) {
                        reaction.aliases.remove(pos);
                        false
                    } else {
                        reaction.aliases.push(alias.to_string());
                        true
                    }
                }
                None => {
                    message.reactions.push(ircultra_types::models::Reaction {
                        emoji: emoji.to_string(),
                        aliases: vec![alias.to_string()],
                    });
                    true
                }
            };
            message.reactions.retain(|r| !r.aliases.is_empty());
            Some((message.clone(), added))
        })
    }

    /// Non-deleted messages in a scope, ascending by timestamp, tail-sliced
    /// to `limit` clamped into `[1, 200]`. `before` bounds the timestamp
    /// exclusively for paging backwards.
    pub fn list_history(
        &self,
        scope: &Scope,
        limit: u32,
        before: Option<chrono::DateTime<Utc>>,
    ) -> Vec<MessageRecord> {
        let limit = limit.clamp(1, 200) as usize;
        self.with_doc(|doc| {
            let mut matching: Vec<_> = doc
                .messages
                .iter()
                .filter(|m| m.scope == *scope && m.deleted_at.is_none())
                .filter(|m| before.map(|b| m.timestamp < b).unwrap_or(true))
                .cloned()
                .collect();
            matching.sort_by_key(|m| m.timestamp);
            if matching.len() > limit {
                matching.split_off(matching.len() - limit)
            } else {
                matching
            }
        })
    }

    /// Case-insensitive substring search over plaintext channel bodies.
    /// Encrypted DM payloads are never searched.
    pub fn search_channel_messages(
        &self,
        channel: &str,
        term: &str,
        limit: usize,
    ) -> Vec<MessageRecord> {
        let needle = term.to_lowercase();
        self.with_doc(|doc| {
            doc.messages
                .iter()
                .filter(|m| {
                    m.deleted_at.is_none()
                        && m.scope.channel() == Some(channel)
                        && m.body
                            .as_deref()
                            .map(|b| b.to_lowercase().contains(&needle))
                            .unwrap_or(false)
                })
                .take(limit)
                .cloned()
                .collect()
        })
    }

    /// Tombstone every live message older than the retention horizon.
    /// Rows are never purged; they stay findable by id for audit.
    pub fn run_retention_cleanup(&self, retention_days: i64) -> usize {
        let horizon = Utc::now() - Duration::days(retention_days);
        self.with_doc_mut(|doc| {
            let now = Utc::now();
            let mut swept = 0;
            for message in doc
                .messages
                .iter_mut()
                .filter(|m| m.deleted_at.is_none() && m.timestamp < horizon)
            {
                message.deleted_at = Some(now);
                swept += 1;
            }
            swept
        })
    }

    // -- Moderation, bots, audit --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_moderation_action(
        &self,
        actor_alias: &str,
        target_alias: &str,
        channel: &str,
        action_type: ModerationKind,
        reason: Option<&str>,
    ) -> ModerationAction {
        self.with_doc_mut(|doc| {
            let action = ModerationAction {
                action_id: Uuid::new_v4(),
                actor_alias: actor_alias.to_string(),
                target_alias: target_alias.to_string(),
                channel: channel.to_string(),
                action_type,
                reason: reason.map(str::to_string),
                created_at: Utc::now(),
            };
            doc.moderation_actions.push(action.clone());
            action
        })
    }

    pub fn list_bots(&self) -> Vec<BotApp> {
        self.with_doc(|doc| doc.bot_apps.clone())
    }

    pub fn find_bot(&self, bot_id: &str) -> Option<BotApp> {
        self.with_doc(|doc| doc.bot_apps.iter().find(|b| b.bot_id == bot_id).cloned())
    }

    pub fn insert_audit_event(&self, category: &str, actor: &str, payload: serde_json::Value) {
        self.with_doc_mut(|doc| {
            doc.audit_events.push(AuditEvent {
                event_id: Uuid::new_v4(),
                category: category.to_string(),
                actor: actor.to_string(),
                payload,
                created_at: Utc::now(),
            });
        });
    }
}
