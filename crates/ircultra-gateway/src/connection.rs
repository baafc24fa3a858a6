//! Per-connection session loop for the session-multiplexed endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ircultra_types::events::{ClientEvent, ErrorCode, ServerEvent};

use crate::dispatcher::Dispatcher;
use crate::hub::Hub;
use crate::rate_limit::RateWindow;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single native WebSocket session.
pub async fn handle_connection(socket: WebSocket, dispatcher: Arc<Dispatcher>, ip: String) {
    let (mut sender, mut receiver) = socket.split();

    let session_id = Uuid::new_v4();
    let (tx, mut rx) = Hub::session_queue();
    dispatcher
        .hub
        .register(session_id, ip.clone(), tx, RateWindow::native());
    info!("Session {} connected from {}", session_id, ip);

    // Shared flag for heartbeat: recv task sets it on Pong, send task
    // checks it. Acquire/Release pairing as usual.
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outbound pump: drain the session queue, serialize, write frames.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // skip the immediate first tick
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Outbound event failed to serialize: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound loop: decode frames and hand them to the dispatcher in
    // arrival order, so a session's events are never reordered.
    let dispatcher_recv = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => dispatcher_recv.handle(session_id, event),
                    Err(e) => {
                        debug!(
                            "Session {} bad event: {} -- raw: {}",
                            session_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                        dispatcher_recv.hub.to_session(
                            session_id,
                            &ServerEvent::error(ErrorCode::BadRequest, "Malformed event"),
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
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
    info!("Session {} disconnected", session_id);
}
