//! End-to-end flows through Dispatcher + Hub + Store, with sessions
//! registered directly on the hub (no sockets).

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use ircultra_gateway::dispatcher::Dispatcher;
use ircultra_gateway::hub::Hub;
use ircultra_gateway::rate_limit::RateWindow;
use ircultra_gateway::wire;
use ircultra_store::Store;
use ircultra_types::events::{ClientEvent, ErrorCode, MessageEventType, ServerEvent};
use ircultra_types::models::EncryptedEnvelope;

struct TestClient {
    sid: Uuid,
    rx: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

fn setup() -> Arc<Dispatcher> {
    let path = std::env::temp_dir().join(format!("ircultra-flow-{}.json", Uuid::new_v4()));
    let store = Store::open(path).expect("open temp store");
    Arc::new(Dispatcher::new(store, Hub::new(), "test motd"))
}

fn connect(d: &Dispatcher) -> TestClient {
    let sid = Uuid::new_v4();
    let (tx, rx) = Hub::session_queue();
    d.hub.register(sid, "127.0.0.1".into(), tx, RateWindow::native());
    TestClient { sid, rx }
}

fn connect_from(d: &Dispatcher, ip: &str) -> TestClient {
    let sid = Uuid::new_v4();
    let (tx, rx) = Hub::session_queue();
    d.hub.register(sid, ip.into(), tx, RateWindow::native());
    TestClient { sid, rx }
}

/// Handshake + claim; returns the issued reclaim nonce.
fn login(d: &Dispatcher, client: &mut TestClient, key: &str, alias: &str) -> String {
    d.handle(
        client.sid,
        ClientEvent::HelloDevice {
            device_id: None,
            device_public_key: key.into(),
        },
    );
    d.handle(
        client.sid,
        ClientEvent::ClaimAlias {
            alias: alias.into(),
            reclaim_nonce: None,
        },
    );
    let events = client.drain();
    events
        .iter()
        .find_map(|e| match e {
            ServerEvent::AliasResult {
                ok: true,
                reclaim_nonce: Some(nonce),
                ..
            } => Some(nonce.clone()),
            _ => None,
        })
        .expect("successful alias_result")
}

fn created_messages(events: &[ServerEvent]) -> Vec<&ircultra_types::models::MessageRecord> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::MessageEvent {
                event_type: MessageEventType::Created,
                message,
                ..
            } => Some(message),
            _ => None,
        })
        .collect()
}

fn envelope(ciphertext: &str) -> EncryptedEnvelope {
    EncryptedEnvelope {
        algorithm: "x25519-xsalsa20".into(),
        nonce: "N".into(),
        ciphertext: ciphertext.into(),
        sender_public_key: "SPK".into(),
        recipient_encrypted_key: "RK".into(),
        sender_encrypted_key: "SK".into(),
    }
}

#[test]
fn two_clients_broadcast_in_lobby() {
    let d = setup();
    let mut a = connect(&d);
    let mut b = connect(&d);
    login(&d, &mut a, "K1", "Alpha");
    login(&d, &mut b, "K2", "Beta");
    a.drain();
    b.drain();

    d.handle(
        a.sid,
        ClientEvent::SendChannelMessage {
            channel: "#lobby".into(),
            body: "hi".into(),
            kind: None,
            reply_to: None,
            thread_id: None,
        },
    );

    let events = b.drain();
    let created = created_messages(&events);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].body.as_deref(), Some("hi"));
    assert_eq!(created[0].sender_alias, "Alpha");
}

#[test]
fn dm_envelope_is_relayed_opaquely() {
    let d = setup();
    let mut a = connect(&d);
    let mut b = connect(&d);
    login(&d, &mut a, "K1", "Alpha");
    login(&d, &mut b, "K2", "Beta");
    a.drain();
    b.drain();

    d.handle(
        a.sid,
        ClientEvent::SendDmMessage {
            target_alias: "Beta".into(),
            encrypted_payload: envelope("CT"),
        },
    );

    for client in [&mut a, &mut b] {
        let events = client.drain();
        let created = created_messages(&events);
        assert_eq!(created.len(), 1);
        let payload = created[0].encrypted_payload.as_ref().expect("envelope");
        assert_eq!(payload.ciphertext, "CT");
        assert!(created[0].body.is_none());
    }

    // The persisted record replays over history.
    let convo_id = d
        .store
        .dm_conversations_for("Alpha")
        .first()
        .map(|c| c.convo_id.clone())
        .expect("conversation exists");
    d.handle(
        a.sid,
        ClientEvent::HistoryFetch {
            scope: ircultra_types::models::Scope::Dm { convo_id },
            before: None,
            limit: None,
        },
    );
    let events = a.drain();
    let snapshot = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::HistorySnapshot { messages, .. } => Some(messages),
            _ => None,
        })
        .expect("history_snapshot");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(
        snapshot[0].encrypted_payload.as_ref().map(|p| p.ciphertext.as_str()),
        Some("CT")
    );
}

#[test]
fn moderation_chain_mutes_and_blocks_sending() {
    let d = setup();
    let mut owner = connect(&d);
    let mut carol = connect(&d);
    let mut dave = connect(&d);
    login(&d, &mut owner, "K1", "Owner");
    login(&d, &mut carol, "K2", "Carol");
    login(&d, &mut dave, "K3", "Dave");

    // Owner creates #room; Carol and Dave join as members.
    for client in [&owner, &carol, &dave] {
        d.handle(
            client.sid,
            ClientEvent::JoinChannel {
                channel: "#room".into(),
            },
        );
    }

    d.handle(
        owner.sid,
        ClientEvent::CommandExec {
            raw: "/op Carol #room".into(),
            context_channel: None,
        },
    );
    d.handle(
        carol.sid,
        ClientEvent::CommandExec {
            raw: "/mute Dave #room".into(),
            context_channel: None,
        },
    );
    dave.drain();

    d.handle(
        dave.sid,
        ClientEvent::SendChannelMessage {
            channel: "#room".into(),
            body: "can I talk?".into(),
            kind: None,
            reply_to: None,
            thread_id: None,
        },
    );
    let events = dave.drain();
    assert!(
        events.iter().any(|e| matches!(
            e,
            ServerEvent::ServerError {
                code: ErrorCode::Forbidden,
                ..
            }
        )),
        "muted member's send refused with FORBIDDEN"
    );
}

#[test]
fn moderation_requires_op() {
    let d = setup();
    let mut owner = connect(&d);
    let mut mallory = connect(&d);
    login(&d, &mut owner, "K1", "Owner");
    login(&d, &mut mallory, "K2", "Mallory");

    for client in [&owner, &mallory] {
        d.handle(
            client.sid,
            ClientEvent::JoinChannel {
                channel: "#room".into(),
            },
        );
    }
    mallory.drain();

    d.handle(
        mallory.sid,
        ClientEvent::CommandExec {
            raw: "/kick Owner #room".into(),
            context_channel: None,
        },
    );
    let events = mallory.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::ServerError {
            code: ErrorCode::Forbidden,
            ..
        }
    )));
}

#[test]
fn alias_reclaim_requires_nonce_and_rotates_it() {
    let d = setup();
    let mut a = connect(&d);
    let nonce = login(&d, &mut a, "K1", "Alpha");

    // Disconnect: alias becomes idle.
    d.disconnect(a.sid);
    assert!(d
        .store
        .alias_record("Alpha")
        .unwrap()
        .active_session_id
        .is_none());

    // A different device from a different address without the nonce fails.
    let mut intruder = connect_from(&d, "203.0.113.9");
    d.handle(
        intruder.sid,
        ClientEvent::HelloDevice {
            device_id: None,
            device_public_key: "K9".into(),
        },
    );
    d.handle(
        intruder.sid,
        ClientEvent::ClaimAlias {
            alias: "Alpha".into(),
            reclaim_nonce: None,
        },
    );
    let events = intruder.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::AliasResult {
            ok: false,
            error_key: Some(ErrorCode::Unauthorized),
            ..
        }
    )));

    // With the nonce the claim succeeds and the nonce rotates.
    d.handle(
        intruder.sid,
        ClientEvent::ClaimAlias {
            alias: "Alpha".into(),
            reclaim_nonce: Some(nonce.clone()),
        },
    );
    let events = intruder.drain();
    let fresh = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::AliasResult {
                ok: true,
                reclaim_nonce: Some(n),
                ..
            } => Some(n.clone()),
            _ => None,
        })
        .expect("reclaim succeeded");
    assert_ne!(fresh, nonce);
}

#[test]
fn live_alias_from_other_address_is_refused() {
    let d = setup();
    let mut a = connect(&d);
    login(&d, &mut a, "K1", "Alpha");

    let mut b = connect_from(&d, "203.0.113.9");
    d.handle(
        b.sid,
        ClientEvent::HelloDevice {
            device_id: None,
            device_public_key: "K2".into(),
        },
    );
    d.handle(
        b.sid,
        ClientEvent::ClaimAlias {
            alias: "Alpha".into(),
            reclaim_nonce: None,
        },
    );
    let events = b.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::AliasResult {
            ok: false,
            error_key: Some(ErrorCode::AliasInUse),
            ..
        }
    )));
}

#[test]
fn rate_limit_refuses_the_26th_send() {
    let d = setup();
    let mut a = connect(&d);
    let mut b = connect(&d);
    login(&d, &mut a, "K1", "Alpha");
    login(&d, &mut b, "K2", "Beta");
    b.drain();

    for i in 0..26 {
        d.handle(
            a.sid,
            ClientEvent::SendChannelMessage {
                channel: "#lobby".into(),
                body: format!("m{i}"),
                kind: None,
                reply_to: None,
                thread_id: None,
            },
        );
    }

    let a_events = a.drain();
    assert!(a_events.iter().any(|e| matches!(
        e,
        ServerEvent::ServerError {
            code: ErrorCode::RateLimit,
            ..
        }
    )));
    let delivered = created_messages(&b.drain()).len();
    assert_eq!(delivered, 25, "exactly the window's worth delivered");
}

#[test]
fn ignored_senders_are_filtered_from_created_events() {
    let d = setup();
    let mut a = connect(&d);
    let mut b = connect(&d);
    login(&d, &mut a, "K1", "Alpha");
    login(&d, &mut b, "K2", "Beta");

    d.handle(
        b.sid,
        ClientEvent::CommandExec {
            raw: "/ignore Alpha".into(),
            context_channel: None,
        },
    );
    b.drain();

    d.handle(
        a.sid,
        ClientEvent::SendChannelMessage {
            channel: "#lobby".into(),
            body: "you can't hear me".into(),
            kind: None,
            reply_to: None,
            thread_id: None,
        },
    );
    let events = b.drain();
    assert!(created_messages(&events)
        .iter()
        .all(|m| m.sender_alias != "Alpha"));
}

#[test]
fn wire_client_shares_the_channel_fabric() {
    let d = setup();
    let mut native = connect(&d);
    login(&d, &mut native, "K1", "Alpha");
    native.drain();

    // Wire session: registered on the hub, driven line by line.
    let wire_sid = Uuid::new_v4();
    let (tx, _wire_rx) = Hub::session_queue();
    d.hub
        .register(wire_sid, "127.0.0.1".into(), tx, RateWindow::wire());

    let mut replies = Vec::new();
    wire::handle_line(&d, wire_sid, "NICK Eve", &mut replies);
    assert!(replies.iter().any(|l| l.contains(" 001 Eve ")));

    replies.clear();
    wire::handle_line(&d, wire_sid, "JOIN #lobby", &mut replies);
    assert!(replies.iter().any(|l| l.contains(" 353 Eve ")));
    assert!(replies.iter().any(|l| l.contains(" 366 Eve ")));

    replies.clear();
    wire::handle_line(&d, wire_sid, "PRIVMSG #lobby :hello", &mut replies);
    assert!(replies.is_empty(), "channel sends are not echoed back");

    // The native client in #lobby observes Eve's message.
    let events = native.drain();
    let created = created_messages(&events);
    assert!(created
        .iter()
        .any(|m| m.sender_alias == "Eve" && m.body.as_deref() == Some("hello")));

    // Nick collision with a live alias yields 433.
    replies.clear();
    wire::handle_line(&d, wire_sid, "PING :token", &mut replies);
    assert_eq!(replies, vec!["PONG :token"]);

    let other_sid = Uuid::new_v4();
    let (tx2, _rx2) = Hub::session_queue();
    d.hub
        .register(other_sid, "203.0.113.7".into(), tx2, RateWindow::wire());
    replies.clear();
    wire::handle_line(&d, other_sid, "NICK Alpha", &mut replies);
    assert!(replies.iter().any(|l| l.contains(" 433 ")));

    // Nick-targeted PRIVMSG echoes to the sender only.
    replies.clear();
    wire::handle_line(&d, wire_sid, "PRIVMSG Alpha :psst", &mut replies);
    assert!(replies.iter().any(|l| l.contains("PRIVMSG Alpha :psst")));
}

#[test]
fn failed_same_address_takeover_leaves_the_holder_intact() {
    let d = setup();
    let mut a = connect(&d);
    let nonce = login(&d, &mut a, "K1", "Alpha");

    // Same address, different device, no nonce: the claim is refused and
    // the live holder keeps the alias and its room.
    let mut b = connect(&d);
    d.handle(
        b.sid,
        ClientEvent::HelloDevice {
            device_id: None,
            device_public_key: "K2".into(),
        },
    );
    d.handle(
        b.sid,
        ClientEvent::ClaimAlias {
            alias: "Alpha".into(),
            reclaim_nonce: None,
        },
    );
    let events = b.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::AliasResult {
            ok: false,
            error_key: Some(ErrorCode::Unauthorized),
            ..
        }
    )));
    assert_eq!(d.hub.find_by_alias("Alpha"), Some(a.sid));
    assert_eq!(
        d.store.alias_record("Alpha").unwrap().active_session_id,
        Some(a.sid)
    );

    // With the nonce the takeover commits and the stale session is
    // displaced.
    d.handle(
        b.sid,
        ClientEvent::ClaimAlias {
            alias: "Alpha".into(),
            reclaim_nonce: Some(nonce),
        },
    );
    let events = b.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::AliasResult { ok: true, .. })));
    assert_eq!(d.hub.find_by_alias("Alpha"), Some(b.sid));
    assert!(d
        .hub
        .session_view(a.sid)
        .map(|v| v.alias.is_none())
        .unwrap_or(false));
}

#[test]
fn context_channel_is_first_joined_not_alphabetical() {
    let d = setup();
    let mut a = connect(&d);
    let mut b = connect(&d);
    login(&d, &mut a, "K1", "Alpha"); // auto-joins #lobby first
    login(&d, &mut b, "K2", "Beta");

    // "#announce" sorts before "#lobby" but was joined later.
    d.handle(
        a.sid,
        ClientEvent::JoinChannel {
            channel: "#announce".into(),
        },
    );
    b.drain();

    d.handle(
        a.sid,
        ClientEvent::CommandExec {
            raw: "where does this go".into(),
            context_channel: None,
        },
    );

    // Beta is only in #lobby, so receiving it proves the routing.
    let events = b.drain();
    let created = created_messages(&events);
    assert!(created
        .iter()
        .any(|m| m.body.as_deref() == Some("where does this go")));
    assert!(created
        .iter()
        .all(|m| m.scope.channel() == Some("#lobby")));
}

#[test]
fn plain_command_exec_text_lands_in_context_channel() {
    let d = setup();
    let mut a = connect(&d);
    let mut b = connect(&d);
    login(&d, &mut a, "K1", "Alpha");
    login(&d, &mut b, "K2", "Beta");
    b.drain();

    d.handle(
        a.sid,
        ClientEvent::CommandExec {
            raw: "just plain text".into(),
            context_channel: Some("#lobby".into()),
        },
    );
    let created = created_messages(&b.drain())
        .iter()
        .map(|m| m.body.clone())
        .collect::<Vec<_>>();
    assert!(created.contains(&Some("just plain text".to_string())));
}

#[test]
fn kick_forces_the_target_out_of_the_room() {
    let d = setup();
    let mut owner = connect(&d);
    let mut target = connect(&d);
    login(&d, &mut owner, "K1", "Owner");
    login(&d, &mut target, "K2", "Troll");

    for client in [&owner, &target] {
        d.handle(
            client.sid,
            ClientEvent::JoinChannel {
                channel: "#room".into(),
            },
        );
    }
    target.drain();

    d.handle(
        owner.sid,
        ClientEvent::CommandExec {
            raw: "/kick Troll #room spamming".into(),
            context_channel: None,
        },
    );

    assert!(d.store.membership("#room", "Troll").is_none());

    // Subsequent room traffic no longer reaches the target.
    target.drain();
    d.handle(
        owner.sid,
        ClientEvent::SendChannelMessage {
            channel: "#room".into(),
            body: "gone now".into(),
            kind: None,
            reply_to: None,
            thread_id: None,
        },
    );
    assert!(created_messages(&target.drain()).is_empty());
}
