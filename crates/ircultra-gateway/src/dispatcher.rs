//! Event dispatcher: decodes nothing itself (the connection loop hands it
//! typed [`ClientEvent`]s), but owns authentication, authorization,
//! validation, rate limiting, store mutation and fan-out for every inbound
//! event. The slash-command interpreter and the classical-wire adaptor
//! re-enter through the same public primitives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use ircultra_store::Store;
use ircultra_types::events::{
    ChannelEventType, ChannelSummary, ClientEvent, ErrorCode, MembershipSummary,
    MessageEventType, PresenceStatus, ServerEvent,
};
use ircultra_types::models::{
    ChannelMode, EncryptedEnvelope, MessageKind, MessageRecord, ModerationKind, Role, Scope,
};

use crate::color::pick_color;
use crate::command;
use crate::commands;
use crate::hub::{alias_room, channel_room, Hub};
use crate::roles::has_role_at_least;
use crate::validate;

/// How long a `/mute` lasts.
const MUTE_MINUTES: i64 = 10;

/// Domain failure: error code plus a short human-readable message for the
/// originating client. Handlers never abort the session on these.
pub type DispatchError = (ErrorCode, String);

fn fail(code: ErrorCode, message: impl Into<String>) -> DispatchError {
    (code, message.into())
}

pub struct Dispatcher {
    pub store: Arc<Store>,
    pub hub: Hub,
    motd: String,
    /// Held across insert+broadcast so per-room delivery order always
    /// matches store insertion order.
    fanout: Mutex<()>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, hub: Hub, motd: impl Into<String>) -> Self {
        Self {
            store,
            hub,
            motd: motd.into(),
            fanout: Mutex::new(()),
        }
    }

    /// Entry point for decoded inbound events from the native endpoint.
    /// Domain errors become a `server_error` to the originator only.
    pub fn handle(&self, sid: Uuid, event: ClientEvent) {
        let rate_limited = matches!(
            event,
            ClientEvent::SendChannelMessage { .. }
                | ClientEvent::SendDmMessage { .. }
                | ClientEvent::CommandExec { .. }
                | ClientEvent::BotInvoke { .. }
        );
        if rate_limited && self.hub.check_rate(sid) == Some(false) {
            self.hub.to_session(
                sid,
                &ServerEvent::error(ErrorCode::RateLimit, "Too many events, slow down"),
            );
            return;
        }

        let result = match event {
            ClientEvent::HelloDevice {
                device_id,
                device_public_key,
            } => self.hello(sid, device_id, &device_public_key),

            ClientEvent::ClaimAlias {
                alias,
                reclaim_nonce,
            } => {
                // Claim failures surface as alias_result, not server_error.
                if let Err((code, message)) =
                    self.claim_alias(sid, &alias, reclaim_nonce.as_deref())
                {
                    self.hub.to_session(
                        sid,
                        &ServerEvent::AliasResult {
                            ok: false,
                            alias: None,
                            reclaim_nonce: None,
                            error_key: Some(code),
                            message: Some(message),
                        },
                    );
                }
                Ok(())
            }

            ClientEvent::CommandExec {
                raw,
                context_channel,
            } => self.command_exec(sid, &raw, context_channel.as_deref()),

            ClientEvent::JoinChannel { channel } => {
                self.join_channel(sid, &channel).map(|_| ())
            }
            ClientEvent::PartChannel { channel, reason } => {
                self.part_channel(sid, &channel, reason.as_deref())
            }

            ClientEvent::SendChannelMessage {
                channel,
                body,
                kind,
                reply_to,
                thread_id,
            } => self
                .send_channel_message(
                    sid,
                    &channel,
                    &body,
                    kind.unwrap_or(MessageKind::Text),
                    reply_to,
                    thread_id,
                )
                .map(|_| ()),

            ClientEvent::SendDmMessage {
                target_alias,
                encrypted_payload,
            } => self
                .send_dm_message(sid, &target_alias, encrypted_payload)
                .map(|_| ()),

            ClientEvent::ReactToggle { message_id, emoji } => {
                self.react_toggle(sid, message_id, &emoji).map(|_| ())
            }
            ClientEvent::MessageEdit { message_id, body } => {
                self.edit_message(sid, message_id, &body).map(|_| ())
            }
            ClientEvent::MessageDelete { message_id } => {
                self.delete_message(sid, message_id).map(|_| ())
            }

            ClientEvent::HistoryFetch {
                scope,
                before,
                limit,
            } => self.history_fetch(sid, &scope, before, limit).map(|_| ()),

            ClientEvent::TypingState { scope, active } => {
                self.typing_state(sid, &scope, active)
            }

            ClientEvent::BotInvoke {
                bot_id,
                command,
                args,
                channel,
            } => self.bot_invoke(sid, &bot_id, &command, &args, channel.as_deref()),
        };

        if let Err((code, message)) = result {
            self.hub
                .to_session(sid, &ServerEvent::error(code, message));
        }
    }

    /// Socket gone: tear down rooms and queue, close the session row,
    /// release the alias and propagate offline presence.
    pub fn disconnect(&self, sid: Uuid) {
        let departed = self.hub.remove_session(sid);
        let released = self.store.close_session(sid);
        let alias = released.or_else(|| departed.and_then(|d| d.alias));
        if let Some(alias) = alias {
            info!("{} went offline", alias);
            self.broadcast_presence(&alias);
        }
    }

    // -- Handshake & identity --

    pub fn hello(
        &self,
        sid: Uuid,
        device_id: Option<Uuid>,
        public_key: &str,
    ) -> Result<(), DispatchError> {
        if public_key.trim().is_empty() {
            return Err(fail(ErrorCode::BadRequest, "devicePublicKey is required"));
        }
        let ip = self
            .hub
            .session_view(sid)
            .map(|v| v.ip)
            .ok_or_else(|| fail(ErrorCode::Internal, "session not registered"))?;

        let device = self.store.upsert_device(device_id, public_key.trim());
        let session = self.store.create_session(sid, device.device_id, &ip);
        self.hub.with_session(sid, |entry| {
            entry.device_id = Some(device.device_id);
            entry.device_public_key = Some(device.public_key.clone());
        });

        let alias = self.store.alias_for_device(device.device_id);
        self.hub.to_session(
            sid,
            &ServerEvent::SessionReady {
                device_id: device.device_id,
                alias,
                resume_token: session.resume_token,
                motd: self.motd.clone(),
            },
        );
        Ok(())
    }

    /// Full alias-claim flow: validation, live-holder arbitration, the
    /// store's device/nonce check, presence and snapshot emission. Returns
    /// the normalized alias.
    pub fn claim_alias(
        &self,
        sid: Uuid,
        raw_alias: &str,
        nonce: Option<&str>,
    ) -> Result<String, DispatchError> {
        let view = self
            .hub
            .session_view(sid)
            .ok_or_else(|| fail(ErrorCode::Internal, "session not registered"))?;
        let device_id = view.device_id.ok_or_else(|| {
            fail(
                ErrorCode::Unauthorized,
                "Handshake required before claiming an alias",
            )
        })?;
        let alias = validate::alias(raw_alias)
            .map_err(|e| fail(ErrorCode::AliasInvalid, e.message("alias")))?;

        // Live-holder arbitration: a holder on another address is refused
        // outright. A same-address holder (reconnect takeover) is only
        // displaced after the store accepts the claim below — a failed
        // device/nonce check must leave the holder untouched.
        let displaced_holder = match self.hub.find_by_alias(&alias) {
            Some(holder) if holder != sid => {
                let holder_ip = self.hub.session_view(holder).map(|v| v.ip);
                if holder_ip.as_deref() != Some(view.ip.as_str()) {
                    return Err(fail(
                        ErrorCode::AliasInUse,
                        format!("{alias} is connected from another address"),
                    ));
                }
                Some(holder)
            }
            _ => None,
        };

        let record = self
            .store
            .claim_alias(&alias, device_id, sid, &view.ip, nonce)
            .map_err(|_| {
                fail(
                    ErrorCode::Unauthorized,
                    "Alias belongs to another device; reclaim nonce required",
                )
            })?;

        if let Some(holder) = displaced_holder {
            // The claim committed: detach the alias from the stale session.
            // The new claim re-announces presence.
            self.hub.with_session(holder, |entry| {
                entry.alias = None;
                entry.color = None;
            });
            self.hub.leave_room(&alias_room(&alias), holder);
            self.store.detach_session_alias(holder);
        }

        // A session switching aliases releases the old one first.
        if let Some(old) = view.alias.clone() {
            if old != alias {
                self.store.release_alias(&old);
                self.hub.leave_room(&alias_room(&old), sid);
                self.broadcast_presence(&old);
            }
        }

        let color = pick_color(&alias, &view.ip, &self.hub.colors_in_use());
        self.hub.with_session(sid, |entry| {
            entry.alias = Some(alias.clone());
            entry.status = PresenceStatus::Online;
            entry.color = Some(color);
        });
        self.hub.join_room(&alias_room(&alias), sid);

        if view.alias.is_none() {
            // First alias on this session: land in the default channel.
            let _ = self.join_channel(sid, "#lobby");
        }

        info!("{} claimed by session {}", alias, sid);
        self.hub.to_session(
            sid,
            &ServerEvent::AliasResult {
                ok: true,
                alias: Some(alias.clone()),
                reclaim_nonce: Some(record.reclaim_nonce),
                error_key: None,
                message: None,
            },
        );
        self.broadcast_presence(&alias);
        self.send_network_snapshot(sid)?;
        Ok(alias)
    }

    // -- Channels --

    pub fn join_channel(&self, sid: Uuid, raw: &str) -> Result<String, DispatchError> {
        let alias = self.require_alias(sid)?;
        let name = validate::channel(raw)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")))?;

        if let Some(member) = self.store.membership(&name, &alias) {
            if member.is_banned {
                return Err(fail(
                    ErrorCode::Forbidden,
                    format!("You are banned from {name}"),
                ));
            }
        } else if let Some(channel) = self.store.channel(&name) {
            if channel.modes.contains(&ChannelMode::InviteOnly)
                && channel.owner_alias != alias
                && !self.hub.has_invite(&name, &alias)
            {
                return Err(fail(
                    ErrorCode::Forbidden,
                    format!("{name} is invite-only"),
                ));
            }
        }

        let (channel, created) = self.store.ensure_channel(&name, &alias);
        if !created {
            self.store.upsert_membership(&name, &alias);
        }
        self.hub.with_session(sid, |entry| {
            if !entry.channels.contains(&name) {
                entry.channels.push(name.clone());
            }
        });
        self.hub.join_room(&channel_room(&name), sid);

        let now = Utc::now();
        if created {
            self.hub.to_room(
                &channel_room(&name),
                &ServerEvent::ChannelEvent {
                    event_type: ChannelEventType::Created,
                    channel: name.clone(),
                    actor: alias.clone(),
                    payload: json!({ "topic": channel.topic }),
                    timestamp: now,
                },
            );
        }
        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::Joined,
                channel: name.clone(),
                actor: alias.clone(),
                payload: json!({ "alias": alias }),
                timestamp: now,
            },
        );
        self.broadcast_presence(&alias);
        self.send_network_snapshot(sid)?;
        Ok(name)
    }

    pub fn part_channel(
        &self,
        sid: Uuid,
        raw: &str,
        reason: Option<&str>,
    ) -> Result<(), DispatchError> {
        let alias = self.require_alias(sid)?;
        let name = validate::channel(raw)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")))?;
        if self.store.channel(&name).is_none() {
            return Err(fail(
                ErrorCode::ChannelNotFound,
                format!("{name} does not exist"),
            ));
        }

        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::Parted,
                channel: name.clone(),
                actor: alias.clone(),
                payload: json!({ "alias": alias, "reason": reason }),
                timestamp: Utc::now(),
            },
        );
        self.store.part_membership(&name, &alias);
        self.hub.with_session(sid, |entry| {
            entry.channels.retain(|c| c != &name);
        });
        self.hub.leave_room(&channel_room(&name), sid);

        self.broadcast_presence(&alias);
        self.send_network_snapshot(sid)?;
        Ok(())
    }

    // -- Messages --

    pub fn send_channel_message(
        &self,
        sid: Uuid,
        raw_channel: &str,
        raw_body: &str,
        kind: MessageKind,
        reply_to: Option<Uuid>,
        thread_id: Option<String>,
    ) -> Result<MessageRecord, DispatchError> {
        let alias = self.require_alias(sid)?;
        let view = self
            .hub
            .session_view(sid)
            .ok_or_else(|| fail(ErrorCode::Internal, "session not registered"))?;
        let name = validate::channel(raw_channel)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")))?;
        let channel = self.store.channel(&name).ok_or_else(|| {
            fail(ErrorCode::ChannelNotFound, format!("{name} does not exist"))
        })?;
        let member = self.store.membership(&name, &alias).ok_or_else(|| {
            fail(ErrorCode::Forbidden, format!("Join {name} before sending"))
        })?;
        if member.is_banned {
            return Err(fail(
                ErrorCode::Forbidden,
                format!("You are banned from {name}"),
            ));
        }
        if let Some(until) = member.muted_until {
            if until > Utc::now() {
                return Err(fail(
                    ErrorCode::Forbidden,
                    format!("You are muted in {name}"),
                ));
            }
        }
        if channel.modes.contains(&ChannelMode::Moderated)
            && !has_role_at_least(Some(member.role), Role::Voice)
        {
            return Err(fail(
                ErrorCode::Forbidden,
                format!("{name} is moderated; voice required"),
            ));
        }
        let body = validate::message_body(raw_body)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("message")))?;

        let scope = match &thread_id {
            Some(tid) => Scope::Thread {
                thread_id: tid.clone(),
                channel: Some(name.clone()),
            },
            None => Scope::Channel {
                channel: name.clone(),
            },
        };
        let message = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: scope.clone(),
            sender_alias: alias,
            sender_device_id: view.device_id.unwrap_or_else(Uuid::nil),
            kind,
            body: Some(body),
            encrypted_payload: None,
            timestamp: Utc::now(),
            reply_to,
            thread_id,
            reactions: vec![],
            deleted_at: None,
        };

        let _order = self.fanout.lock().expect("fanout lock poisoned");
        self.store.insert_message(message.clone());
        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::MessageEvent {
                event_type: MessageEventType::Created,
                scope,
                message: message.clone(),
            },
        );
        Ok(message)
    }

    pub fn send_dm_message(
        &self,
        sid: Uuid,
        raw_target: &str,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageRecord, DispatchError> {
        let alias = self.require_alias(sid)?;
        let view = self
            .hub
            .session_view(sid)
            .ok_or_else(|| fail(ErrorCode::Internal, "session not registered"))?;
        if view
            .device_public_key
            .as_deref()
            .unwrap_or("")
            .is_empty()
        {
            return Err(fail(
                ErrorCode::Unauthorized,
                "A device public key is required for direct messages",
            ));
        }
        let target = validate::alias(raw_target)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("alias")))?;
        if target == alias {
            return Err(fail(
                ErrorCode::BadRequest,
                "Cannot open a conversation with yourself",
            ));
        }
        if self.store.alias_record(&target).is_none() {
            return Err(fail(
                ErrorCode::BadRequest,
                format!("Unknown alias {target}"),
            ));
        }

        let convo = self.store.get_or_create_dm_conversation(&alias, &target);
        let message = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: Scope::Dm {
                convo_id: convo.convo_id.clone(),
            },
            sender_alias: alias,
            sender_device_id: view.device_id.unwrap_or_else(Uuid::nil),
            kind: MessageKind::Text,
            body: None,
            encrypted_payload: Some(envelope),
            timestamp: Utc::now(),
            reply_to: None,
            thread_id: None,
            reactions: vec![],
            deleted_at: None,
        };

        let _order = self.fanout.lock().expect("fanout lock poisoned");
        self.store.insert_message(message.clone());
        let event = ServerEvent::MessageEvent {
            event_type: MessageEventType::Created,
            scope: message.scope.clone(),
            message: message.clone(),
        };
        self.hub.to_room(&alias_room(&convo.alias_a), &event);
        self.hub.to_room(&alias_room(&convo.alias_b), &event);
        Ok(message)
    }

    /// `/msg` plaintext variant: resolves the DM conversation and delivers
    /// a server-visible TEXT event to both alias rooms without persisting —
    /// stored DM rows stay envelope-only.
    pub fn plaintext_dm(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_text: &str,
    ) -> Result<(), DispatchError> {
        let alias = self.require_alias(sid)?;
        let view = self
            .hub
            .session_view(sid)
            .ok_or_else(|| fail(ErrorCode::Internal, "session not registered"))?;
        let target = validate::alias(raw_target)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("alias")))?;
        if target == alias {
            return Err(fail(
                ErrorCode::BadRequest,
                "Cannot open a conversation with yourself",
            ));
        }
        if self.store.alias_record(&target).is_none() {
            return Err(fail(
                ErrorCode::BadRequest,
                format!("Unknown alias {target}"),
            ));
        }
        let body = validate::message_body(raw_text)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("message")))?;

        let convo = self.store.get_or_create_dm_conversation(&alias, &target);
        let message = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: Scope::Dm {
                convo_id: convo.convo_id.clone(),
            },
            sender_alias: alias,
            sender_device_id: view.device_id.unwrap_or_else(Uuid::nil),
            kind: MessageKind::Text,
            body: Some(body),
            encrypted_payload: None,
            timestamp: Utc::now(),
            reply_to: None,
            thread_id: None,
            reactions: vec![],
            deleted_at: None,
        };
        let event = ServerEvent::MessageEvent {
            event_type: MessageEventType::Created,
            scope: message.scope.clone(),
            message,
        };
        let _order = self.fanout.lock().expect("fanout lock poisoned");
        self.hub.to_room(&alias_room(&convo.alias_a), &event);
        self.hub.to_room(&alias_room(&convo.alias_b), &event);
        Ok(())
    }

    pub fn react_toggle(
        &self,
        sid: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<bool, DispatchError> {
        let alias = self.require_alias(sid)?;
        // 64 bytes is generous for any real emoji sequence.
        if emoji.is_empty() || emoji.len() > 64 {
            return Err(fail(ErrorCode::BadRequest, "Invalid emoji"));
        }
        let message = self
            .store
            .find_message(message_id)
            .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown message"))?;
        self.authorize_scope(&alias, &message.scope)?;

        let (updated, added) = self
            .store
            .toggle_reaction(message_id, &alias, emoji)
            .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown message"))?;

        let event_type = if added {
            MessageEventType::ReactionAdded
        } else {
            MessageEventType::ReactionRemoved
        };
        let _order = self.fanout.lock().expect("fanout lock poisoned");
        self.emit_to_scope(
            sid,
            &updated.scope.clone(),
            ServerEvent::MessageEvent {
                event_type,
                scope: updated.scope.clone(),
                message: updated,
            },
        );
        Ok(added)
    }

    pub fn edit_message(
        &self,
        sid: Uuid,
        message_id: Uuid,
        raw_body: &str,
    ) -> Result<MessageRecord, DispatchError> {
        let alias = self.require_alias(sid)?;
        let message = self
            .store
            .find_message(message_id)
            .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown message"))?;
        if message.sender_alias != alias {
            return Err(fail(
                ErrorCode::Forbidden,
                "Only the author can edit a message",
            ));
        }
        if message.encrypted_payload.is_some() {
            return Err(fail(
                ErrorCode::BadRequest,
                "Encrypted messages cannot be edited",
            ));
        }
        let body = validate::message_body(raw_body)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("message")))?;

        let updated = self
            .store
            .edit_message(message_id, &body)
            .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown message"))?;
        let _order = self.fanout.lock().expect("fanout lock poisoned");
        self.emit_to_scope(
            sid,
            &updated.scope.clone(),
            ServerEvent::MessageEvent {
                event_type: MessageEventType::Edited,
                scope: updated.scope.clone(),
                message: updated.clone(),
            },
        );
        Ok(updated)
    }

    pub fn delete_message(
        &self,
        sid: Uuid,
        message_id: Uuid,
    ) -> Result<MessageRecord, DispatchError> {
        let alias = self.require_alias(sid)?;
        let message = self
            .store
            .find_message(message_id)
            .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown message"))?;
        if message.sender_alias != alias {
            return Err(fail(
                ErrorCode::Forbidden,
                "Only the author can delete a message",
            ));
        }
        let updated = self
            .store
            .delete_message(message_id)
            .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown message"))?;
        let _order = self.fanout.lock().expect("fanout lock poisoned");
        self.emit_to_scope(
            sid,
            &updated.scope.clone(),
            ServerEvent::MessageEvent {
                event_type: MessageEventType::Deleted,
                scope: updated.scope.clone(),
                message: updated.clone(),
            },
        );
        Ok(updated)
    }

    pub fn history_fetch(
        &self,
        sid: Uuid,
        scope: &Scope,
        before: Option<chrono::DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<MessageRecord>, DispatchError> {
        let alias = self.require_alias(sid)?;
        self.authorize_scope(&alias, scope)?;
        let messages = self.store.list_history(scope, limit.unwrap_or(50), before);
        self.hub.to_session(
            sid,
            &ServerEvent::HistorySnapshot {
                scope: scope.clone(),
                messages: messages.clone(),
            },
        );
        Ok(messages)
    }

    pub fn typing_state(
        &self,
        sid: Uuid,
        scope: &Scope,
        active: bool,
    ) -> Result<(), DispatchError> {
        let alias = self.require_alias(sid)?;
        let Scope::Channel { channel } = scope else {
            return Err(fail(ErrorCode::BadRequest, "Typing state is channel-scoped"));
        };
        self.authorize_scope(&alias, scope)?;
        self.hub.to_room(
            &channel_room(channel),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::MemberUpdated,
                channel: channel.clone(),
                actor: alias.clone(),
                payload: json!({ "alias": alias, "typing": active }),
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn bot_invoke(
        &self,
        sid: Uuid,
        bot_id: &str,
        bot_command: &str,
        args: &[String],
        channel: Option<&str>,
    ) -> Result<(), DispatchError> {
        let alias = self.require_alias(sid)?;
        let bot = self
            .store
            .find_bot(bot_id)
            .ok_or_else(|| fail(ErrorCode::BadRequest, format!("Unknown bot {bot_id}")))?;
        let name = self.resolve_context_channel(sid, channel)?;
        if self.store.channel(&name).is_none() {
            return Err(fail(
                ErrorCode::ChannelNotFound,
                format!("{name} does not exist"),
            ));
        }
        if self.store.membership(&name, &alias).is_none() {
            return Err(fail(
                ErrorCode::Forbidden,
                format!("Join {name} before invoking bots"),
            ));
        }

        let input = if args.is_empty() {
            bot_command.to_string()
        } else {
            args.join(" ")
        };
        let output = match bot.bot_id.as_str() {
            "echo" => input,
            _ => format!("{} v{} ran {}", bot.name, bot.version, bot_command),
        };

        let now = Utc::now();
        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::BotEvent {
                bot_id: bot.bot_id.clone(),
                channel: name.clone(),
                output: output.clone(),
                timestamp: now,
            },
        );

        // Mirror the output into the channel as a NOTICE record.
        let message = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: Scope::Channel {
                channel: name.clone(),
            },
            sender_alias: bot.bot_id.clone(),
            sender_device_id: Uuid::nil(),
            kind: MessageKind::Notice,
            body: Some(output),
            encrypted_payload: None,
            timestamp: now,
            reply_to: None,
            thread_id: None,
            reactions: vec![],
            deleted_at: None,
        };
        {
            let _order = self.fanout.lock().expect("fanout lock poisoned");
            self.store.insert_message(message.clone());
            self.hub.to_room(
                &channel_room(&name),
                &ServerEvent::MessageEvent {
                    event_type: MessageEventType::Created,
                    scope: message.scope.clone(),
                    message,
                },
            );
        }
        self.store.insert_audit_event(
            "bot",
            &alias,
            json!({ "botId": bot.bot_id, "command": bot_command, "channel": name }),
        );
        Ok(())
    }

    // -- Presence & status --

    pub fn set_away(&self, sid: Uuid, away: bool) -> Result<(), DispatchError> {
        let alias = self.require_alias(sid)?;
        self.hub.with_session(sid, |entry| {
            entry.status = if away {
                PresenceStatus::Away
            } else {
                PresenceStatus::Online
            };
        });
        self.broadcast_presence(&alias);
        Ok(())
    }

    pub fn set_ignore(
        &self,
        sid: Uuid,
        raw_target: &str,
        ignored: bool,
    ) -> Result<String, DispatchError> {
        self.require_alias(sid)?;
        let target = validate::alias(raw_target)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("alias")))?;
        self.hub.with_session(sid, |entry| {
            if ignored {
                entry.ignored.insert(target.clone());
            } else {
                entry.ignored.remove(&target);
            }
        });
        Ok(target)
    }

    /// Presence fan-out for an alias: status comes from its live session,
    /// or offline when none holds it.
    pub fn broadcast_presence(&self, alias: &str) {
        let status = self
            .hub
            .find_by_alias(alias)
            .and_then(|sid| self.hub.session_view(sid))
            .map(|v| v.status)
            .unwrap_or(PresenceStatus::Offline);
        let channels: Vec<String> = self
            .store
            .memberships_for_alias(alias)
            .into_iter()
            .map(|(channel, _)| channel)
            .collect();
        let public_key = self
            .store
            .alias_record(alias)
            .and_then(|rec| self.store.device(rec.current_device_id))
            .map(|d| d.public_key)
            .unwrap_or_default();
        let color = self
            .hub
            .find_by_alias(alias)
            .and_then(|sid| self.hub.session_view(sid))
            .and_then(|v| v.color)
            .unwrap_or_default();

        self.hub.broadcast_all(&ServerEvent::PresenceEvent {
            alias: alias.to_string(),
            status,
            channels,
            public_key,
            color,
        });
    }

    pub fn send_network_snapshot(&self, sid: Uuid) -> Result<(), DispatchError> {
        let alias = self.require_alias(sid)?;
        let channels = self
            .store
            .list_channels()
            .into_iter()
            .map(|c| ChannelSummary {
                member_count: self.store.member_count(&c.name),
                modes: c.modes.iter().map(|m| m.as_flag().to_string()).collect(),
                name: c.name,
                topic: c.topic,
                owner_alias: c.owner_alias,
            })
            .collect();
        let dms = self.store.dm_conversations_for(&alias);
        let memberships = self
            .store
            .memberships_for_alias(&alias)
            .into_iter()
            .map(|(channel, m)| MembershipSummary {
                channel,
                role: m.role,
                joined_at: m.joined_at,
            })
            .collect();
        self.hub.to_session(
            sid,
            &ServerEvent::NetworkSnapshot {
                channels,
                dms,
                memberships,
                unread_counters: HashMap::new(),
            },
        );
        Ok(())
    }

    // -- Moderation --

    pub fn set_member_role(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_channel: &str,
        new_role: Role,
    ) -> Result<(), DispatchError> {
        let (actor, name, target) = self.moderation_prelude(sid, raw_target, raw_channel)?;
        let member = self
            .store
            .set_member_role(&name, &target, new_role)
            .ok_or_else(|| {
                fail(ErrorCode::BadRequest, format!("{target} is not in {name}"))
            })?;

        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::MemberUpdated,
                channel: name.clone(),
                actor: actor.clone(),
                payload: json!({ "alias": target, "role": member.role }),
                timestamp: Utc::now(),
            },
        );
        self.store.insert_moderation_action(
            &actor,
            &target,
            &name,
            ModerationKind::RoleSet,
            None,
        );
        self.store.insert_audit_event(
            "moderation",
            &actor,
            json!({ "type": "ROLE_SET", "target": target, "channel": name, "role": member.role.as_str() }),
        );
        Ok(())
    }

    pub fn set_member_ban(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_channel: &str,
        reason: Option<&str>,
        banned: bool,
    ) -> Result<(), DispatchError> {
        let (actor, name, target) = self.moderation_prelude(sid, raw_target, raw_channel)?;
        self.store
            .set_member_ban(&name, &target, banned)
            .ok_or_else(|| {
                fail(ErrorCode::BadRequest, format!("{target} is not in {name}"))
            })?;

        if banned {
            // Banned members drop out of the fan-out set; the row stays.
            if let Some(target_sid) = self.hub.find_by_alias(&target) {
                self.hub.leave_room(&channel_room(&name), target_sid);
                self.hub.with_session(target_sid, |entry| {
                    entry.channels.retain(|c| c != &name);
                });
            }
        }

        let action = if banned {
            ModerationKind::Ban
        } else {
            ModerationKind::Unban
        };
        self.emit_moderation(&name, &target, &actor, action, reason);
        Ok(())
    }

    pub fn set_member_mute(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_channel: &str,
        mute: bool,
    ) -> Result<(), DispatchError> {
        let (actor, name, target) = self.moderation_prelude(sid, raw_target, raw_channel)?;
        let until = mute.then(|| Utc::now() + Duration::minutes(MUTE_MINUTES));
        self.store
            .set_member_mute(&name, &target, until)
            .ok_or_else(|| {
                fail(ErrorCode::BadRequest, format!("{target} is not in {name}"))
            })?;

        let action = if mute {
            ModerationKind::Mute
        } else {
            ModerationKind::Unmute
        };
        self.emit_moderation(&name, &target, &actor, action, None);
        Ok(())
    }

    pub fn kick_member(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_channel: &str,
        reason: Option<&str>,
    ) -> Result<(), DispatchError> {
        let (actor, name, target) = self.moderation_prelude(sid, raw_target, raw_channel)?;
        if self.store.membership(&name, &target).is_none() {
            return Err(fail(
                ErrorCode::BadRequest,
                format!("{target} is not in {name}"),
            ));
        }

        // Announce while the target still receives the room.
        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::Kicked,
                channel: name.clone(),
                actor: actor.clone(),
                payload: json!({ "alias": target, "reason": reason }),
                timestamp: Utc::now(),
            },
        );

        self.store.part_membership(&name, &target);
        if let Some(target_sid) = self.hub.find_by_alias(&target) {
            self.hub.leave_room(&channel_room(&name), target_sid);
            self.hub.with_session(target_sid, |entry| {
                entry.channels.retain(|c| c != &name);
            });
        }
        self.emit_moderation(&name, &target, &actor, ModerationKind::Kick, reason);
        Ok(())
    }

    pub fn invite_member(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_channel: &str,
    ) -> Result<(), DispatchError> {
        let (actor, name, target) = self.moderation_prelude(sid, raw_target, raw_channel)?;
        self.hub.grant_invite(&name, &target);

        let event = ServerEvent::ChannelEvent {
            event_type: ChannelEventType::Invited,
            channel: name.clone(),
            actor: actor.clone(),
            payload: json!({ "alias": target }),
            timestamp: Utc::now(),
        };
        self.hub.to_room(&channel_room(&name), &event);
        self.hub.to_room(&alias_room(&target), &event);
        Ok(())
    }

    /// `/topic` read or set. Reading is open to members; setting needs OP.
    pub fn topic(
        &self,
        sid: Uuid,
        raw_channel: &str,
        text: Option<&str>,
    ) -> Result<String, DispatchError> {
        let alias = self.require_alias(sid)?;
        let name = validate::channel(raw_channel)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")))?;
        let channel = self.store.channel(&name).ok_or_else(|| {
            fail(ErrorCode::ChannelNotFound, format!("{name} does not exist"))
        })?;

        let Some(text) = text else {
            return Ok(channel.topic);
        };

        self.require_channel_role(&name, &alias, Role::Op)?;
        let topic = validate::text(text);
        self.store.set_topic(&name, &topic);
        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::TopicChanged,
                channel: name,
                actor: alias,
                payload: json!({ "topic": topic }),
                timestamp: Utc::now(),
            },
        );
        Ok(topic)
    }

    /// `/mode #c +X|-X`: set or clear one flag, broadcast the full set.
    pub fn set_mode(
        &self,
        sid: Uuid,
        raw_channel: &str,
        mode_spec: &str,
    ) -> Result<Vec<ChannelMode>, DispatchError> {
        let alias = self.require_alias(sid)?;
        let name = validate::channel(raw_channel)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")))?;
        self.require_channel_role(&name, &alias, Role::Op)?;

        let mut chars = mode_spec.chars();
        let (enable, letter) = match (chars.next(), chars.next(), chars.next()) {
            (Some('+'), Some(letter), None) => (true, letter),
            (Some('-'), Some(letter), None) => (false, letter),
            _ => {
                return Err(fail(
                    ErrorCode::BadRequest,
                    "Mode must be +X or -X with one flag",
                ))
            }
        };
        let mode = ChannelMode::from_letter(letter)
            .ok_or_else(|| fail(ErrorCode::BadRequest, format!("Unknown mode {letter}")))?;

        let modes = self
            .store
            .toggle_mode(&name, mode, enable)
            .ok_or_else(|| {
                fail(ErrorCode::ChannelNotFound, format!("{name} does not exist"))
            })?;

        self.hub.to_room(
            &channel_room(&name),
            &ServerEvent::ChannelEvent {
                event_type: ChannelEventType::ModeChanged,
                channel: name,
                actor: alias,
                payload: json!({
                    "modes": modes.iter().map(|m| m.as_flag()).collect::<Vec<_>>()
                }),
                timestamp: Utc::now(),
            },
        );
        Ok(modes)
    }

    // -- Command execution --

    /// `command_exec`: slash commands go to the interpreter; anything else
    /// is plain channel text to the context channel.
    pub fn command_exec(
        &self,
        sid: Uuid,
        raw: &str,
        context_channel: Option<&str>,
    ) -> Result<(), DispatchError> {
        match command::parse(raw) {
            Some(parsed) => commands::execute(self, sid, parsed, context_channel),
            None => {
                let channel = self.resolve_context_channel(sid, context_channel)?;
                self.send_channel_message(sid, &channel, raw, MessageKind::Text, None, None)
                    .map(|_| ())
            }
        }
    }

    /// The supplied context channel, or the session's first joined channel.
    pub fn resolve_context_channel(
        &self,
        sid: Uuid,
        context: Option<&str>,
    ) -> Result<String, DispatchError> {
        if let Some(raw) = context {
            return validate::channel(raw)
                .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")));
        }
        self.hub
            .session_view(sid)
            .and_then(|v| v.channels.first().cloned())
            .ok_or_else(|| fail(ErrorCode::BadRequest, "No channel context; join one first"))
    }

    /// One-shot NOTICE to the originator (command replies, listings).
    /// Synthetic `server` sender, never persisted.
    pub fn system_notice(&self, sid: Uuid, text: impl Into<String>) {
        let channel = self
            .hub
            .session_view(sid)
            .and_then(|v| v.channels.first().cloned())
            .unwrap_or_else(|| "#lobby".to_string());
        let scope = Scope::Channel { channel };
        let message = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: scope.clone(),
            sender_alias: "server".into(),
            sender_device_id: Uuid::nil(),
            kind: MessageKind::Notice,
            body: Some(text.into()),
            encrypted_payload: None,
            timestamp: Utc::now(),
            reply_to: None,
            thread_id: None,
            reactions: vec![],
            deleted_at: None,
        };
        self.hub.to_session(
            sid,
            &ServerEvent::MessageEvent {
                event_type: MessageEventType::Created,
                scope,
                message,
            },
        );
    }

    // -- Shared checks --

    pub fn require_alias(&self, sid: Uuid) -> Result<String, DispatchError> {
        self.hub
            .session_view(sid)
            .and_then(|v| v.alias)
            .ok_or_else(|| fail(ErrorCode::Unauthorized, "An alias is required first"))
    }

    pub fn require_channel_role(
        &self,
        channel: &str,
        alias: &str,
        min: Role,
    ) -> Result<(), DispatchError> {
        if self.store.channel(channel).is_none() {
            return Err(fail(
                ErrorCode::ChannelNotFound,
                format!("{channel} does not exist"),
            ));
        }
        let role = self.store.membership(channel, alias).map(|m| m.role);
        if !has_role_at_least(role, min) {
            return Err(fail(
                ErrorCode::Forbidden,
                format!("{} required in {channel}", min.as_str()),
            ));
        }
        Ok(())
    }

    fn moderation_prelude(
        &self,
        sid: Uuid,
        raw_target: &str,
        raw_channel: &str,
    ) -> Result<(String, String, String), DispatchError> {
        let actor = self.require_alias(sid)?;
        let name = validate::channel(raw_channel)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("channel")))?;
        self.require_channel_role(&name, &actor, Role::Op)?;
        let target = validate::alias(raw_target)
            .map_err(|e| fail(ErrorCode::BadRequest, e.message("alias")))?;
        Ok((actor, name, target))
    }

    fn emit_moderation(
        &self,
        channel: &str,
        target: &str,
        actor: &str,
        action: ModerationKind,
        reason: Option<&str>,
    ) {
        let event = ServerEvent::ModerationEvent {
            action,
            actor: actor.to_string(),
            target: target.to_string(),
            channel: channel.to_string(),
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        };
        self.hub.to_room(&channel_room(channel), &event);
        self.hub.to_room(&alias_room(target), &event);
        self.store
            .insert_moderation_action(actor, target, channel, action, reason);
        self.store.insert_audit_event(
            "moderation",
            actor,
            json!({ "type": action, "target": target, "channel": channel, "reason": reason }),
        );
    }

    /// Membership checks for acting inside a scope: channel members only,
    /// DM participants only. Bare threads carry no extra gate.
    fn authorize_scope(&self, alias: &str, scope: &Scope) -> Result<(), DispatchError> {
        match scope {
            Scope::Channel { channel }
            | Scope::Thread {
                channel: Some(channel),
                ..
            } => {
                let member = self.store.membership(channel, alias).ok_or_else(|| {
                    fail(ErrorCode::Forbidden, format!("Not a member of {channel}"))
                })?;
                if member.is_banned {
                    return Err(fail(
                        ErrorCode::Forbidden,
                        format!("You are banned from {channel}"),
                    ));
                }
                Ok(())
            }
            Scope::Dm { convo_id } => {
                let convo = self
                    .store
                    .dm_conversation(convo_id)
                    .ok_or_else(|| fail(ErrorCode::BadRequest, "Unknown conversation"))?;
                if !convo.involves(alias) {
                    return Err(fail(
                        ErrorCode::Forbidden,
                        "Not a participant of this conversation",
                    ));
                }
                Ok(())
            }
            Scope::Thread { channel: None, .. } => Ok(()),
        }
    }

    /// Deliver an event to the rooms a scope maps to: the channel room,
    /// both DM alias rooms, or the originator for a bare thread.
    fn emit_to_scope(&self, originator: Uuid, scope: &Scope, event: ServerEvent) {
        match scope {
            Scope::Channel { channel }
            | Scope::Thread {
                channel: Some(channel),
                ..
            } => self.hub.to_room(&channel_room(channel), &event),
            Scope::Dm { convo_id } => {
                if let Some(convo) = self.store.dm_conversation(convo_id) {
                    self.hub.to_room(&alias_room(&convo.alias_a), &event);
                    self.hub.to_room(&alias_room(&convo.alias_b), &event);
                }
            }
            Scope::Thread { channel: None, .. } => {
                self.hub.to_session(originator, &event);
            }
        }
    }
}
