//! Slash-command interpreter. Each command composes dispatcher primitives;
//! role checks resolve against the current channel's membership inside
//! those primitives.

use uuid::Uuid;

use ircultra_types::events::ErrorCode;
use ircultra_types::models::MessageKind;

use crate::command::ParsedCommand;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::roles::role_from_mode;

const HELP_TEXT: &str = "Commands: /help /nick /whoami /away /back /quit /join /part /list /names /who /whois /topic /mode /op /deop /voice /devoice /ban /unban /mute /unmute /kick /invite /msg /me /notice /reply /thread /ignore /unignore /search /pin /unpin /clear /bot";

/// Maximum `/search` results returned.
const SEARCH_LIMIT: usize = 8;

fn usage(text: &str) -> DispatchError {
    (ErrorCode::BadRequest, format!("Usage: {text}"))
}

/// Everything after the first `skip` argument tokens, original spacing
/// preserved (for topics, reasons and message tails).
fn tail(cmd: &ParsedCommand, skip: usize) -> String {
    let mut rest = cmd.raw_args.as_str();
    for _ in 0..skip {
        rest = rest
            .split_once(char::is_whitespace)
            .map(|(_, tail)| tail.trim_start())
            .unwrap_or("");
    }
    rest.to_string()
}

pub fn execute(
    d: &Dispatcher,
    sid: Uuid,
    cmd: ParsedCommand,
    context_channel: Option<&str>,
) -> Result<(), DispatchError> {
    let context = |d: &Dispatcher| d.resolve_context_channel(sid, context_channel);

    match cmd.name.as_str() {
        "help" => {
            d.system_notice(sid, HELP_TEXT);
            Ok(())
        }

        "nick" => {
            let alias = cmd.args.first().ok_or_else(|| usage("/nick <alias>"))?;
            d.claim_alias(sid, alias, None).map(|_| ())
        }

        "whoami" => {
            let alias = d.require_alias(sid)?;
            let ip = d
                .hub
                .session_view(sid)
                .map(|v| v.ip)
                .unwrap_or_default();
            d.system_notice(sid, format!("You are {alias} connected from {ip}"));
            Ok(())
        }

        "away" => d.set_away(sid, true),
        "back" => d.set_away(sid, false),

        "quit" => {
            d.disconnect(sid);
            Ok(())
        }

        "join" => {
            let channel = cmd.args.first().ok_or_else(|| usage("/join #channel"))?;
            d.join_channel(sid, channel).map(|_| ())
        }

        "part" => {
            let (channel, reason) = match cmd.args.first() {
                Some(c) if c.starts_with('#') => {
                    let reason = tail(&cmd, 1);
                    (c.clone(), (!reason.is_empty()).then_some(reason))
                }
                _ => (context(d)?, None),
            };
            d.part_channel(sid, &channel, reason.as_deref())
        }

        "list" => {
            d.require_alias(sid)?;
            let channels = d.store.list_channels();
            if channels.is_empty() {
                d.system_notice(sid, "No channels yet");
            } else {
                let lines: Vec<String> = channels
                    .iter()
                    .map(|c| {
                        format!(
                            "{} ({} members) {}",
                            c.name,
                            d.store.member_count(&c.name),
                            c.topic
                        )
                    })
                    .collect();
                d.system_notice(sid, lines.join(" | "));
            }
            Ok(())
        }

        "names" => {
            d.require_alias(sid)?;
            let channel = match cmd.args.first() {
                Some(c) => crate::validate::channel(c)
                    .map_err(|e| (ErrorCode::BadRequest, e.message("channel")))?,
                None => context(d)?,
            };
            if d.store.channel(&channel).is_none() {
                return Err((
                    ErrorCode::ChannelNotFound,
                    format!("{channel} does not exist"),
                ));
            }
            let names: Vec<String> = d
                .store
                .channel_members(&channel)
                .into_iter()
                .map(|(alias, member)| format!("{alias}[{}]", member.role.as_str()))
                .collect();
            d.system_notice(sid, format!("{channel}: {}", names.join(" ")));
            Ok(())
        }

        "who" => {
            d.require_alias(sid)?;
            let aliases = d.hub.live_aliases();
            d.system_notice(sid, format!("Online: {}", aliases.join(" ")));
            Ok(())
        }

        "whois" => {
            d.require_alias(sid)?;
            let target = cmd.args.first().ok_or_else(|| usage("/whois <alias>"))?;
            let view = d
                .hub
                .find_by_alias(target)
                .and_then(|target_sid| d.hub.session_view(target_sid))
                .ok_or_else(|| {
                    (ErrorCode::BadRequest, format!("{target} is offline"))
                })?;
            let status = match view.status {
                ircultra_types::events::PresenceStatus::Online => "online",
                ircultra_types::events::PresenceStatus::Away => "away",
                ircultra_types::events::PresenceStatus::Offline => "offline",
            };
            d.system_notice(
                sid,
                format!("{target} is {status}, in {}", view.channels.join(" ")),
            );
            Ok(())
        }

        "topic" => {
            let channel = cmd.args.first().ok_or_else(|| usage("/topic #channel [text]"))?;
            let text = tail(&cmd, 1);
            if text.is_empty() {
                let topic = d.topic(sid, channel, None)?;
                let shown = if topic.is_empty() { "(no topic)" } else { &topic };
                d.system_notice(sid, format!("{channel} topic: {shown}"));
            } else {
                d.topic(sid, channel, Some(&text))?;
            }
            Ok(())
        }

        "mode" => {
            let channel = cmd.args.first().ok_or_else(|| usage("/mode #channel +X|-X"))?;
            let spec = cmd.args.get(1).ok_or_else(|| usage("/mode #channel +X|-X"))?;
            d.set_mode(sid, channel, spec).map(|_| ())
        }

        "op" | "deop" | "voice" | "devoice" => {
            let target = cmd
                .args
                .first()
                .ok_or_else(|| usage("/op <alias> [#channel]"))?;
            let channel = match cmd.args.get(1) {
                Some(c) => c.clone(),
                None => context(d)?,
            };
            // The parser guarantees the name is one of the four mode verbs.
            let role = role_from_mode(&cmd.name)
                .ok_or_else(|| (ErrorCode::Internal, "unreachable mode verb".to_string()))?;
            d.set_member_role(sid, target, &channel, role)
        }

        "ban" | "unban" => {
            let target = cmd
                .args
                .first()
                .ok_or_else(|| usage("/ban <alias> #channel [reason]"))?;
            let channel = cmd
                .args
                .get(1)
                .ok_or_else(|| usage("/ban <alias> #channel [reason]"))?;
            let reason = tail(&cmd, 2);
            d.set_member_ban(
                sid,
                target,
                channel,
                (!reason.is_empty()).then_some(reason.as_str()),
                cmd.name == "ban",
            )
        }

        "mute" | "unmute" => {
            let target = cmd
                .args
                .first()
                .ok_or_else(|| usage("/mute <alias> #channel"))?;
            let channel = cmd
                .args
                .get(1)
                .ok_or_else(|| usage("/mute <alias> #channel"))?;
            d.set_member_mute(sid, target, channel, cmd.name == "mute")
        }

        "kick" => {
            let target = cmd
                .args
                .first()
                .ok_or_else(|| usage("/kick <alias> #channel [reason]"))?;
            let channel = cmd
                .args
                .get(1)
                .ok_or_else(|| usage("/kick <alias> #channel [reason]"))?;
            let reason = tail(&cmd, 2);
            d.kick_member(
                sid,
                target,
                channel,
                (!reason.is_empty()).then_some(reason.as_str()),
            )
        }

        "invite" => {
            let target = cmd
                .args
                .first()
                .ok_or_else(|| usage("/invite <alias> #channel"))?;
            let channel = cmd
                .args
                .get(1)
                .ok_or_else(|| usage("/invite <alias> #channel"))?;
            d.invite_member(sid, target, channel)
        }

        "msg" => {
            let target = cmd.args.first().ok_or_else(|| usage("/msg <alias> <text>"))?;
            let text = tail(&cmd, 1);
            if text.is_empty() {
                return Err(usage("/msg <alias> <text>"));
            }
            d.plaintext_dm(sid, target, &text)
        }

        "me" => {
            if cmd.raw_args.is_empty() {
                return Err(usage("/me <action>"));
            }
            let channel = context(d)?;
            d.send_channel_message(
                sid,
                &channel,
                &cmd.raw_args,
                MessageKind::Action,
                None,
                None,
            )
            .map(|_| ())
        }

        "notice" => {
            if cmd.raw_args.is_empty() {
                return Err(usage("/notice <text>"));
            }
            let channel = context(d)?;
            d.send_channel_message(
                sid,
                &channel,
                &cmd.raw_args,
                MessageKind::Notice,
                None,
                None,
            )
            .map(|_| ())
        }

        "reply" => {
            let id = cmd.args.first().ok_or_else(|| usage("/reply <msgId> <text>"))?;
            let message_id: Uuid = id
                .parse()
                .map_err(|_| (ErrorCode::BadRequest, format!("Bad message id {id}")))?;
            let text = tail(&cmd, 1);
            if text.is_empty() {
                return Err(usage("/reply <msgId> <text>"));
            }
            let parent = d
                .store
                .find_message(message_id)
                .ok_or_else(|| (ErrorCode::BadRequest, "Unknown message".to_string()))?;
            let (channel, thread_id) = match &parent.scope {
                ircultra_types::models::Scope::Channel { channel } => (channel.clone(), None),
                ircultra_types::models::Scope::Thread { thread_id, channel } => (
                    channel.clone().map(Ok).unwrap_or_else(|| context(d))?,
                    Some(thread_id.clone()),
                ),
                ircultra_types::models::Scope::Dm { .. } => {
                    return Err((
                        ErrorCode::BadRequest,
                        "Replies to direct messages are not supported".to_string(),
                    ))
                }
            };
            d.send_channel_message(
                sid,
                &channel,
                &text,
                MessageKind::Text,
                Some(message_id),
                thread_id,
            )
            .map(|_| ())
        }

        "thread" => {
            let thread_id = cmd
                .args
                .first()
                .ok_or_else(|| usage("/thread <threadId> <text>"))?;
            let text = tail(&cmd, 1);
            if text.is_empty() {
                return Err(usage("/thread <threadId> <text>"));
            }
            let channel = context(d)?;
            d.send_channel_message(
                sid,
                &channel,
                &text,
                MessageKind::Text,
                None,
                Some(thread_id.clone()),
            )
            .map(|_| ())
        }

        "ignore" | "unignore" => {
            let target = cmd.args.first().ok_or_else(|| usage("/ignore <alias>"))?;
            let ignoring = cmd.name == "ignore";
            let target = d.set_ignore(sid, target, ignoring)?;
            let verb = if ignoring { "Ignoring" } else { "No longer ignoring" };
            d.system_notice(sid, format!("{verb} {target}"));
            Ok(())
        }

        "search" => {
            d.require_alias(sid)?;
            if cmd.raw_args.is_empty() {
                return Err(usage("/search <term>"));
            }
            let channel = context(d)?;
            let hits = d
                .store
                .search_channel_messages(&channel, &cmd.raw_args, SEARCH_LIMIT);
            if hits.is_empty() {
                d.system_notice(sid, format!("No matches for '{}'", cmd.raw_args));
            } else {
                let lines: Vec<String> = hits
                    .iter()
                    .map(|m| {
                        format!("{}: {}", m.sender_alias, m.body.as_deref().unwrap_or(""))
                    })
                    .collect();
                d.system_notice(sid, lines.join(" | "));
            }
            Ok(())
        }

        // Acknowledged without server state mutation in this version.
        "pin" | "unpin" | "clear" => {
            d.require_alias(sid)?;
            d.system_notice(sid, format!("/{} acknowledged", cmd.name));
            Ok(())
        }

        "bot" => match cmd.args.first().map(String::as_str) {
            Some("list") => {
                d.require_alias(sid)?;
                let bots: Vec<String> = d
                    .store
                    .list_bots()
                    .iter()
                    .map(|b| format!("{} ({} v{})", b.bot_id, b.name, b.version))
                    .collect();
                d.system_notice(sid, format!("Bots: {}", bots.join(" | ")));
                Ok(())
            }
            Some("run") => {
                let bot_id = cmd
                    .args
                    .get(1)
                    .ok_or_else(|| usage("/bot run <botId> [args...]"))?;
                let args: Vec<String> = cmd.args.iter().skip(2).cloned().collect();
                d.bot_invoke(sid, bot_id, "run", &args, context_channel)
            }
            _ => Err(usage("/bot list | /bot run <botId> [args...]")),
        },

        unknown => Err((
            ErrorCode::BadRequest,
            format!("Unknown command /{unknown}"),
        )),
    }
}
