//! Connection hub: owns per-session state and the room fan-out sets.
//!
//! Rooms are keyed `alias:<A>` (one per live alias) and `channel:<name>`.
//! Delivery uses a bounded per-session queue; an overflowing session is
//! torn down rather than allowed to stall everyone else.
//!
//! Locks are `std::sync` and critical sections never cross an await point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use ircultra_types::events::{PresenceStatus, ServerEvent};

use crate::rate_limit::RateWindow;

/// Capacity of the per-session outbound queue.
const SESSION_QUEUE_CAPACITY: usize = 256;

pub fn alias_room(alias: &str) -> String {
    format!("alias:{alias}")
}

pub fn channel_room(channel: &str) -> String {
    format!("channel:{channel}")
}

/// Mutable per-session connection state. `channels` keeps join order —
/// context resolution routes to the first *joined* channel, so the list
/// must never be re-sorted.
pub struct SessionEntry {
    pub tx: mpsc::Sender<ServerEvent>,
    pub ip: String,
    pub device_id: Option<Uuid>,
    pub device_public_key: Option<String>,
    pub alias: Option<String>,
    pub status: PresenceStatus,
    pub channels: Vec<String>,
    pub ignored: HashSet<String>,
    pub limiter: RateWindow,
    pub color: Option<String>,
}

/// Read-only snapshot of a session, safe to use outside the hub locks.
/// `channels` preserves join order.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub ip: String,
    pub device_id: Option<Uuid>,
    pub device_public_key: Option<String>,
    pub alias: Option<String>,
    pub status: PresenceStatus,
    pub channels: Vec<String>,
    pub color: Option<String>,
}

/// What a torn-down session was holding, for dispatcher cleanup.
pub struct Departed {
    pub alias: Option<String>,
    pub channels: Vec<String>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,
    /// Session-lifetime invites granted by `/invite`, keyed by channel.
    invites: RwLock<HashMap<String, HashSet<String>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                invites: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn register(
        &self,
        session_id: Uuid,
        ip: String,
        tx: mpsc::Sender<ServerEvent>,
        limiter: RateWindow,
    ) {
        let entry = SessionEntry {
            tx,
            ip,
            device_id: None,
            device_public_key: None,
            alias: None,
            status: PresenceStatus::Online,
            channels: Vec::new(),
            ignored: HashSet::new(),
            limiter,
            color: None,
        };
        self.inner
            .sessions
            .write()
            .expect("sessions lock poisoned")
            .insert(session_id, entry);
    }

    /// Remove a session from the registry and every room. Dropping the
    /// queue sender ends the connection's send pump, which closes the
    /// socket.
    pub fn remove_session(&self, session_id: Uuid) -> Option<Departed> {
        let entry = self
            .inner
            .sessions
            .write()
            .expect("sessions lock poisoned")
            .remove(&session_id)?;

        let mut rooms = self.inner.rooms.write().expect("rooms lock poisoned");
        for members in rooms.values_mut() {
            members.remove(&session_id);
        }
        rooms.retain(|_, members| !members.is_empty());

        Some(Departed {
            alias: entry.alias,
            channels: entry.channels,
        })
    }

    pub fn join_room(&self, room: &str, session_id: Uuid) {
        self.inner
            .rooms
            .write()
            .expect("rooms lock poisoned")
            .entry(room.to_string())
            .or_default()
            .insert(session_id);
    }

    pub fn leave_room(&self, room: &str, session_id: Uuid) {
        let mut rooms = self.inner.rooms.write().expect("rooms lock poisoned");
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Mutate a session's state under the registry lock.
    pub fn with_session<F, T>(&self, session_id: Uuid, f: F) -> Option<T>
    where
        F: FnOnce(&mut SessionEntry) -> T,
    {
        self.inner
            .sessions
            .write()
            .expect("sessions lock poisoned")
            .get_mut(&session_id)
            .map(f)
    }

    pub fn session_view(&self, session_id: Uuid) -> Option<SessionView> {
        self.inner
            .sessions
            .read()
            .expect("sessions lock poisoned")
            .get(&session_id)
            .map(|entry| SessionView {
                ip: entry.ip.clone(),
                device_id: entry.device_id,
                device_public_key: entry.device_public_key.clone(),
                alias: entry.alias.clone(),
                status: entry.status,
                channels: entry.channels.clone(),
                color: entry.color.clone(),
            })
    }

    /// Per-session rate check. `None` when the session is gone.
    pub fn check_rate(&self, session_id: Uuid) -> Option<bool> {
        self.with_session(session_id, |entry| entry.limiter.check())
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<Uuid> {
        self.inner
            .sessions
            .read()
            .expect("sessions lock poisoned")
            .iter()
            .find(|(_, entry)| entry.alias.as_deref() == Some(alias))
            .map(|(sid, _)| *sid)
    }

    /// All aliases with a live session, sorted.
    pub fn live_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<_> = self
            .inner
            .sessions
            .read()
            .expect("sessions lock poisoned")
            .values()
            .filter_map(|entry| entry.alias.clone())
            .collect();
        aliases.sort();
        aliases
    }

    pub fn colors_in_use(&self) -> HashSet<String> {
        self.inner
            .sessions
            .read()
            .expect("sessions lock poisoned")
            .values()
            .filter_map(|entry| entry.color.clone())
            .collect()
    }

    // -- Invites (session-lifetime, for +i channels) --

    pub fn grant_invite(&self, channel: &str, alias: &str) {
        self.inner
            .invites
            .write()
            .expect("invites lock poisoned")
            .entry(channel.to_string())
            .or_default()
            .insert(alias.to_string());
    }

    pub fn has_invite(&self, channel: &str, alias: &str) -> bool {
        self.inner
            .invites
            .read()
            .expect("invites lock poisoned")
            .get(channel)
            .map(|set| set.contains(alias))
            .unwrap_or(false)
    }

    // -- Delivery --

    /// Deliver to one session. Returns `false` when the session is gone
    /// or was torn down for back-pressure overflow.
    pub fn to_session(&self, session_id: Uuid, event: &ServerEvent) -> bool {
        let result = {
            let sessions = self.inner.sessions.read().expect("sessions lock poisoned");
            match sessions.get(&session_id) {
                Some(entry) => entry.tx.try_send(event.clone()),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Session {} outbound buffer overflow, disconnecting",
                    session_id
                );
                self.remove_session(session_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Fan an event out to every session in a room. Freshly created
    /// messages are dropped for sessions that ignore the sender.
    pub fn to_room(&self, room: &str, event: &ServerEvent) {
        let targets: Vec<Uuid> = {
            let rooms = self.inner.rooms.read().expect("rooms lock poisoned");
            rooms
                .get(room)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default()
        };
        self.deliver(&targets, event);
    }

    /// Deliver to every connected session (presence propagation).
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let targets: Vec<Uuid> = {
            let sessions = self.inner.sessions.read().expect("sessions lock poisoned");
            sessions.keys().copied().collect()
        };
        self.deliver(&targets, event);
    }

    fn deliver(&self, targets: &[Uuid], event: &ServerEvent) {
        let sender = event.created_message_sender().map(str::to_string);
        let mut overflowed = Vec::new();
        {
            let sessions = self.inner.sessions.read().expect("sessions lock poisoned");
            for sid in targets {
                let Some(entry) = sessions.get(sid) else {
                    continue;
                };
                if let Some(sender) = &sender {
                    if entry.ignored.contains(sender) {
                        continue;
                    }
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*sid),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        for sid in overflowed {
            warn!("Session {} outbound buffer overflow, disconnecting", sid);
            self.remove_session(sid);
        }
    }

    /// Create the bounded outbound queue for a new session.
    pub fn session_queue() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(SESSION_QUEUE_CAPACITY)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ircultra_types::events::ErrorCode;

    fn register(hub: &Hub) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        let sid = Uuid::new_v4();
        let (tx, rx) = Hub::session_queue();
        hub.register(sid, "127.0.0.1".into(), tx, RateWindow::native());
        (sid, rx)
    }

    #[test]
    fn room_fanout_reaches_only_members() {
        let hub = Hub::new();
        let (a, mut rx_a) = register(&hub);
        let (_b, mut rx_b) = register(&hub);
        hub.join_room(&channel_room("#lobby"), a);

        hub.to_room(
            &channel_room("#lobby"),
            &ServerEvent::error(ErrorCode::Internal, "x"),
        );
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn removed_session_leaves_all_rooms() {
        let hub = Hub::new();
        let (a, _rx) = register(&hub);
        hub.join_room(&channel_room("#lobby"), a);
        hub.with_session(a, |entry| entry.alias = Some("alpha".into()));

        let departed = hub.remove_session(a).unwrap();
        assert_eq!(departed.alias.as_deref(), Some("alpha"));
        assert!(hub.find_by_alias("alpha").is_none());
    }

    #[test]
    fn ignore_filter_drops_created_messages_only() {
        use chrono::Utc;
        use ircultra_types::events::MessageEventType;
        use ircultra_types::models::{MessageKind, MessageRecord, Scope};

        let hub = Hub::new();
        let (a, mut rx_a) = register(&hub);
        hub.join_room(&channel_room("#lobby"), a);
        hub.with_session(a, |entry| {
            entry.ignored.insert("troll".into());
        });

        let message = MessageRecord {
            message_id: Uuid::new_v4(),
            scope: Scope::Channel {
                channel: "#lobby".into(),
            },
            sender_alias: "troll".into(),
            sender_device_id: Uuid::new_v4(),
            kind: MessageKind::Text,
            body: Some("spam".into()),
            encrypted_payload: None,
            timestamp: Utc::now(),
            reply_to: None,
            thread_id: None,
            reactions: vec![],
            deleted_at: None,
        };
        let created = ServerEvent::MessageEvent {
            event_type: MessageEventType::Created,
            scope: message.scope.clone(),
            message: message.clone(),
        };
        hub.to_room(&channel_room("#lobby"), &created);
        assert!(rx_a.try_recv().is_err(), "ignored sender filtered");

        // Non-CREATED kinds from the same sender pass through.
        let deleted = ServerEvent::MessageEvent {
            event_type: MessageEventType::Deleted,
            scope: message.scope.clone(),
            message,
        };
        hub.to_room(&channel_room("#lobby"), &deleted);
        assert!(rx_a.try_recv().is_ok());
    }
}
