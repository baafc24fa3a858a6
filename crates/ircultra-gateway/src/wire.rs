//! Classical-wire adaptor: CR/LF-framed IRC lines over the `/webirc`
//! endpoint. Recognizes PING, NICK, JOIN, LIST and PRIVMSG, re-entering
//! the dispatcher's primitives so wire clients share the channel fabric
//! with native sessions. Outbound channel traffic is rendered as prefixed
//! PRIVMSG lines.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use ircultra_types::events::{ErrorCode, MessageEventType, ServerEvent};
use ircultra_types::models::{MessageKind, Role};

use crate::dispatcher::Dispatcher;
use crate::hub::Hub;
use crate::rate_limit::RateWindow;

const SERVER_NAME: &str = "irc-ultra";

/// Synthetic public key for wire devices: the classical protocol has no
/// handshake, but the session fabric expects a device identity.
const WIRE_DEVICE_KEY: &str = "webirc";

/// Handle one wire connection.
pub async fn handle_connection(socket: WebSocket, dispatcher: Arc<Dispatcher>, ip: String) {
    let (mut sender, mut receiver) = socket.split();

    let session_id = Uuid::new_v4();
    let (tx, mut rx) = Hub::session_queue();
    dispatcher
        .hub
        .register(session_id, ip.clone(), tx, RateWindow::wire());
    info!("Wire session {} connected from {}", session_id, ip);

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

    // Outbound pump: direct protocol replies plus hub events rendered as
    // IRC lines.
    let dispatcher_send = dispatcher.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => Some(line),
                    None => break,
                },
                event = rx.recv() => match event {
                    Some(event) => render_event(&dispatcher_send, session_id, &event),
                    None => break,
                },
            };
            if let Some(line) = line {
                if sender
                    .send(Message::Text(format!("{line}\r\n").into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    // Inbound loop: reassemble CR/LF lines across frames.
    let dispatcher_recv = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut buffer = String::new();
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    buffer.push_str(&text);
                    while let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim_end_matches(['\r', '\n']).to_string();
                        let mut replies = Vec::new();
                        handle_line(&dispatcher_recv, session_id, &line, &mut replies);
                        for reply in replies {
                            if line_tx.send(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(session_id);
    info!("Wire session {} disconnected", session_id);
}

fn nick_of(d: &Dispatcher, sid: Uuid) -> Option<String> {
    d.hub.session_view(sid).and_then(|v| v.alias)
}

fn numeric(nick: Option<&str>, code: &str, rest: &str) -> String {
    format!(":{SERVER_NAME} {code} {} {rest}", nick.unwrap_or("*"))
}

fn server_notice(nick: Option<&str>, text: &str) -> String {
    format!(":{SERVER_NAME} NOTICE {} :{text}", nick.unwrap_or("*"))
}

/// Render a hub event as an IRC line, or `None` when the wire protocol has
/// no representation for it. Own messages are not echoed back.
fn render_event(d: &Dispatcher, sid: Uuid, event: &ServerEvent) -> Option<String> {
    let ServerEvent::MessageEvent {
        event_type: MessageEventType::Created,
        scope,
        message,
    } = event
    else {
        return None;
    };
    let channel = scope.channel()?;
    let body = message.body.as_deref()?;
    let own = nick_of(d, sid);
    if own.as_deref() == Some(message.sender_alias.as_str()) {
        return None;
    }
    let sender = &message.sender_alias;
    Some(format!(
        ":{sender}!{sender}@{SERVER_NAME} PRIVMSG {channel} :{body}"
    ))
}

/// Interpret one inbound line, pushing direct replies into `out`.
pub fn handle_line(d: &Dispatcher, sid: Uuid, line: &str, out: &mut Vec<String>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let nick = nick_of(d, sid);

    match verb.to_ascii_uppercase().as_str() {
        "PING" => {
            let token = rest.trim_start_matches(':');
            out.push(format!("PONG :{token}"));
        }

        "NICK" => {
            let Some(wanted) = rest.split_whitespace().next() else {
                out.push(numeric(nick.as_deref(), "461", "NICK :Not enough parameters"));
                return;
            };
            // First contact: materialize a device + session for the wire
            // client before the claim.
            let needs_hello = d
                .hub
                .session_view(sid)
                .map(|v| v.device_id.is_none())
                .unwrap_or(true);
            if needs_hello {
                if let Err((_, message)) = d.hello(sid, None, WIRE_DEVICE_KEY) {
                    out.push(server_notice(nick.as_deref(), &message));
                    return;
                }
            }

            let first_registration = nick.is_none();
            match d.claim_alias(sid, wanted, None) {
                Ok(alias) => {
                    if first_registration {
                        out.push(numeric(
                            Some(&alias),
                            "001",
                            &format!(":Welcome to the {SERVER_NAME} gateway {alias}"),
                        ));
                    }
                }
                Err((ErrorCode::AliasInvalid, _)) => {
                    out.push(numeric(
                        nick.as_deref(),
                        "432",
                        &format!("{wanted} :Erroneous nickname"),
                    ));
                }
                Err(_) => {
                    // In use by a live session, or bound to another device.
                    out.push(numeric(
                        nick.as_deref(),
                        "433",
                        &format!("{wanted} :Nickname is already in use"),
                    ));
                }
            }
        }

        "JOIN" => {
            let Some(channel) = rest.split_whitespace().next() else {
                out.push(numeric(nick.as_deref(), "461", "JOIN :Not enough parameters"));
                return;
            };
            if nick.is_none() {
                out.push(server_notice(None, "Register a nick first"));
                return;
            }
            match d.join_channel(sid, channel) {
                Ok(name) => {
                    let names: Vec<String> = d
                        .store
                        .channel_members(&name)
                        .into_iter()
                        .map(|(alias, member)| {
                            let prefix = if member.role >= Role::Op {
                                "@"
                            } else if member.role >= Role::Voice {
                                "+"
                            } else {
                                ""
                            };
                            format!("{prefix}{alias}")
                        })
                        .collect();
                    let me = nick_of(d, sid);
                    out.push(numeric(
                        me.as_deref(),
                        "353",
                        &format!("= {name} :{}", names.join(" ")),
                    ));
                    out.push(numeric(
                        me.as_deref(),
                        "366",
                        &format!("{name} :End of /NAMES list"),
                    ));
                }
                Err((ErrorCode::Forbidden, message)) => {
                    out.push(server_notice(nick.as_deref(), &message));
                }
                Err(_) => {
                    out.push(numeric(
                        nick.as_deref(),
                        "401",
                        &format!("{channel} :No such nick/channel"),
                    ));
                }
            }
        }

        "LIST" => {
            for channel in d.store.list_channels() {
                out.push(numeric(
                    nick.as_deref(),
                    "322",
                    &format!(
                        "{} {} :{}",
                        channel.name,
                        d.store.member_count(&channel.name),
                        channel.topic
                    ),
                ));
            }
            out.push(numeric(nick.as_deref(), "323", ":End of /LIST"));
        }

        "PRIVMSG" => {
            let (target, text) = match rest.split_once(' ') {
                Some((target, tail)) => {
                    let tail = tail.trim();
                    let text = tail.strip_prefix(':').unwrap_or(tail);
                    (target, text)
                }
                None => {
                    out.push(numeric(
                        nick.as_deref(),
                        "461",
                        "PRIVMSG :Not enough parameters",
                    ));
                    return;
                }
            };
            if text.trim().is_empty() {
                out.push(numeric(nick.as_deref(), "412", ":No text to send"));
                return;
            }
            let Some(me) = nick else {
                out.push(server_notice(None, "Register a nick first"));
                return;
            };

            if d.hub.check_rate(sid) == Some(false) {
                out.push(server_notice(Some(&me), "Rate limit exceeded"));
                return;
            }

            if target.starts_with('#') {
                match d.send_channel_message(sid, target, text, MessageKind::Text, None, None)
                {
                    Ok(_) => {}
                    Err((ErrorCode::Forbidden, message))
                    | Err((ErrorCode::RateLimit, message)) => {
                        out.push(server_notice(Some(&me), &message));
                    }
                    Err(_) => {
                        out.push(numeric(
                            Some(&me),
                            "401",
                            &format!("{target} :No such nick/channel"),
                        ));
                    }
                }
            } else if d.hub.find_by_alias(target).is_some() {
                // Echoed to the sender only; not delivered to the target
                // in this version.
                out.push(format!(
                    ":{me}!{me}@{SERVER_NAME} PRIVMSG {target} :{text}"
                ));
            } else {
                out.push(numeric(
                    Some(&me),
                    "401",
                    &format!("{target} :No such nick/channel"),
                ));
            }
        }

        other => {
            debug!("Wire session {} sent unrecognized verb {}", sid, other);
        }
    }
}
