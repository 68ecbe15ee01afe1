//! routes transport events into rooms
//!
//! A freshly accepted session knows nothing about rooms; the client's
//! first reliable message is a bind naming the room and the participant
//! slot it got from the HTTP join.  Until that arrives the session sits
//! in the pending table (datagrams from it are dropped on the floor).
//! Once bound, datagrams flow to the room's audio path and control
//! messages are dispatched here.
//!
//! The binder holds a strong reference to every pending session so the
//! transport can hand ownership across without the session dying under
//! it.  Binding moves that reference into the bound table alongside the
//! room routing; close drops whichever one exists.
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::control_message::ControlMessage;
use crate::common::transport::{TransportCallbacks, TransportSession};
use crate::server::room_manager::RoomManager;
use crate::utils;

struct PendingSession {
    session: Arc<dyn TransportSession>,
    since: Instant,
}

struct BoundSession {
    room_name: String,
    participant_id: String,
    session: Arc<dyn TransportSession>,
}

pub struct SessionBinder {
    room_manager: Arc<RoomManager>,
    // session id -> session awaiting its bind message
    pending: Mutex<HashMap<String, PendingSession>>,
    // session id -> where its traffic goes
    bound: Mutex<HashMap<String, BoundSession>>,
    pending_timeout: Duration,
    ping_seq: AtomicU64,
}

impl SessionBinder {
    pub fn new(room_manager: Arc<RoomManager>, pending_timeout: Duration) -> SessionBinder {
        SessionBinder {
            room_manager,
            pending: Mutex::new(HashMap::new()),
            bound: Mutex::new(HashMap::new()),
            pending_timeout,
            ping_seq: AtomicU64::new(0),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn bound_count(&self) -> usize {
        self.bound.lock().unwrap().len()
    }

    /// Drop pending sessions that never sent a bind.  Called from the
    /// reaper sweep.
    pub fn reap_stale_pending(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|sid, p| {
            let keep = p.since.elapsed() < self.pending_timeout;
            if !keep {
                info!("dropping session {} that never bound", sid);
            }
            keep
        });
        before - pending.len()
    }

    /// Probe every bound session with a reliable ping; replies land in
    /// the latency tracker via the pong dispatch.  Returns how many went
    /// out.
    pub fn send_pings(&self) -> usize {
        let targets: Vec<(String, Arc<dyn TransportSession>)> = {
            let bound = self.bound.lock().unwrap();
            bound
                .values()
                .map(|b| (b.participant_id.clone(), Arc::clone(&b.session)))
                .collect()
        };
        let tracker = self.room_manager.latency_tracker();
        let now_ms = utils::get_nano_time() as f64 / 1_000_000.0;
        for (participant_id, session) in &targets {
            let ping_id = self.ping_seq.fetch_add(1, Ordering::Relaxed);
            tracker.record_ping(participant_id, ping_id);
            let ping = ControlMessage::Ping {
                id: ping_id,
                t: now_ms,
            };
            session.send_reliable(&ping.to_string());
        }
        targets.len()
    }

    fn handle_bound_message(&self, sid: &str, raw: &Value) -> () {
        let (room_name, participant_id, session) = {
            let bound = self.bound.lock().unwrap();
            match bound.get(sid) {
                Some(b) => (
                    b.room_name.clone(),
                    b.participant_id.clone(),
                    Arc::clone(&b.session),
                ),
                None => return,
            }
        };

        match raw["type"].as_str() {
            Some("ping") => {
                // echo the same object back, type flipped to pong
                let mut reply = raw.clone();
                reply["type"] = Value::from("pong");
                session.send_reliable(&reply.to_string());
            }
            Some("pong") => {
                if let Ok(ControlMessage::Pong { id, t }) = ControlMessage::from_json(raw) {
                    self.room_manager
                        .latency_tracker()
                        .record_pong(&participant_id, id, t);
                }
            }
            Some("gain") => match ControlMessage::from_json(raw) {
                Ok(ControlMessage::Gain {
                    participant_id: source,
                    value,
                }) => {
                    if let Some(room) = self.room_manager.get_room(&room_name) {
                        room.set_gain(&participant_id, &source, value);
                    }
                }
                _ => debug!("bad gain message from {}", sid),
            },
            Some("mute") => match ControlMessage::from_json(raw) {
                Ok(ControlMessage::Mute {
                    participant_id: source,
                    muted,
                }) => {
                    if let Some(room) = self.room_manager.get_room(&room_name) {
                        room.set_mute(&participant_id, &source, muted);
                    }
                }
                _ => debug!("bad mute message from {}", sid),
            },
            Some(other) => debug!("ignoring {} from bound session {}", other, sid),
            None => debug!("typeless message from bound session {}", sid),
        }
    }

    fn handle_bind(&self, sid: &str, session: &dyn TransportSession, raw: &Value) -> () {
        let (participant_id, room_name) = match ControlMessage::from_json(raw) {
            Ok(ControlMessage::Bind {
                participant_id,
                room,
            }) => (participant_id, room),
            Ok(other) => {
                warn!("expected bind from {}, got {}", sid, other);
                return;
            }
            Err(e) => {
                warn!("unparseable message from pending session {}: {}", sid, e);
                return;
            }
        };

        let room = match self.room_manager.get_room(&room_name) {
            Some(r) => r,
            None => {
                warn!("bind to unknown room {} from {}", room_name, sid);
                session.send_reliable(
                    &ControlMessage::Error {
                        error: String::from("room_not_found"),
                    }
                    .to_string(),
                );
                return;
            }
        };

        // take ownership out of pending for the handover
        let owned = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(sid)
        };
        let owned = match owned {
            Some(p) => p.session,
            None => {
                warn!("bind from a session not in pending: {}", sid);
                return;
            }
        };

        if !room.attach_session(&participant_id, Arc::clone(&owned)) {
            warn!(
                "no participant {} in room {} for session {}",
                participant_id, room_name, sid
            );
            session.send_reliable(
                &ControlMessage::Error {
                    error: String::from("participant_not_found"),
                }
                .to_string(),
            );
            // keep the session alive so the client can retry the bind
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                String::from(sid),
                PendingSession {
                    session: owned,
                    since: Instant::now(),
                },
            );
            return;
        }

        info!(
            "session {} bound to room={} participant={}",
            sid, room_name, participant_id
        );
        let mut bound = self.bound.lock().unwrap();
        bound.insert(
            String::from(sid),
            BoundSession {
                room_name,
                participant_id,
                session: owned,
            },
        );
    }
}

impl TransportCallbacks for SessionBinder {
    fn on_session_open(&self, session: Arc<dyn TransportSession>) {
        let sid = session.id();
        debug!("new session awaiting bind: {}", sid);
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            sid,
            PendingSession {
                session,
                since: Instant::now(),
            },
        );
    }

    fn on_message(&self, session: &dyn TransportSession, message: &str) {
        let sid = session.id();
        let raw: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid JSON from {}: {}", sid, e);
                return;
            }
        };

        let is_bound = self.bound.lock().unwrap().contains_key(&sid);
        if is_bound {
            self.handle_bound_message(&sid, &raw);
        } else {
            self.handle_bind(&sid, session, &raw);
        }
    }

    fn on_datagram(&self, session: &dyn TransportSession, data: &[u8]) {
        let sid = session.id();
        let (room_name, participant_id) = {
            let bound = self.bound.lock().unwrap();
            match bound.get(&sid) {
                Some(b) => (b.room_name.clone(), b.participant_id.clone()),
                None => return, // not bound yet, drop silently
            }
        };
        if let Some(room) = self.room_manager.get_room(&room_name) {
            room.on_audio_received(&participant_id, data);
        }
    }

    fn on_session_close(&self, session: &dyn TransportSession) {
        let sid = session.id();
        self.pending.lock().unwrap().remove(&sid);

        let binding = {
            let mut bound = self.bound.lock().unwrap();
            bound.remove(&sid)
        };
        if let Some(b) = binding {
            info!(
                "session {} closed (room={} participant={})",
                sid, b.room_name, b.participant_id
            );
            self.room_manager
                .leave_room(&b.room_name, &b.participant_id);
        }
    }
}

#[cfg(test)]
mod test_session_binder {
    use super::*;
    use crate::common::transport::MockTransportSession;
    use crate::server::room_manager::{JoinResult, ManagerSettings};

    fn setup() -> (Arc<RoomManager>, SessionBinder) {
        let manager = Arc::new(RoomManager::new(ManagerSettings::default()));
        manager.initialize_default_rooms();
        let binder = SessionBinder::new(Arc::clone(&manager), Duration::from_secs(30));
        (manager, binder)
    }

    fn mock_session(sid: &str) -> MockTransportSession {
        let mut mock = MockTransportSession::new();
        let sid = String::from(sid);
        mock.expect_id().returning(move || sid.clone());
        mock
    }

    fn join(manager: &Arc<RoomManager>, room: &str, alias: &str) -> String {
        match manager.join_room(room, alias, "", None) {
            JoinResult::Success { participant_id } => participant_id,
            other => panic!("join failed: {:?}", other),
        }
    }

    #[test]
    fn bind_to_unknown_room_keeps_session_pending() {
        let (manager, binder) = setup();
        let mut mock = mock_session("s1");
        mock.expect_send_reliable()
            .withf(|m: &str| m.contains("room_not_found"))
            .times(1)
            .returning(|_| true);
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            r#"{"type":"bind","participant_id":"p1","room":"Backstage"}"#,
        );
        assert_eq!(binder.pending_count(), 1);
        assert_eq!(binder.bound_count(), 0);
        manager.shutdown();
    }

    #[test]
    fn bind_to_unknown_participant_keeps_session_pending() {
        let (manager, binder) = setup();
        let mut mock = mock_session("s1");
        mock.expect_send_reliable()
            .withf(|m: &str| m.contains("participant_not_found"))
            .times(1)
            .returning(|_| true);
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            r#"{"type":"bind","participant_id":"nobody","room":"Allegro"}"#,
        );
        // still pending so the client can retry after joining properly
        assert_eq!(binder.pending_count(), 1);
        assert_eq!(binder.bound_count(), 0);
        manager.shutdown();
    }

    #[test]
    fn good_bind_moves_session_to_bound() {
        let (manager, binder) = setup();
        let pid = join(&manager, "Allegro", "ann");
        let mut mock = mock_session("s1");
        // the room sends the roster on attach
        mock.expect_send_reliable()
            .withf(|m: &str| m.contains("room_state"))
            .times(1)
            .returning(|_| true);
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"bind","participant_id":"{}","room":"Allegro"}}"#, pid),
        );
        assert_eq!(binder.pending_count(), 0);
        assert_eq!(binder.bound_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn garbage_is_dropped_quietly() {
        let (manager, binder) = setup();
        let session = Arc::new(mock_session("s1"));
        binder.on_session_open(session.clone());
        binder.on_message(&*session, "this is not json");
        binder.on_message(&*session, r#"{"no_type": true}"#);
        binder.on_message(&*session, r#"{"type":"bind"}"#);
        assert_eq!(binder.pending_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn datagrams_before_bind_are_dropped() {
        let (manager, binder) = setup();
        let session = Arc::new(mock_session("s1"));
        binder.on_session_open(session.clone());
        binder.on_datagram(&*session, &[0u8; 264]);
        manager.shutdown();
    }

    #[test]
    fn ping_echoes_as_pong_with_same_fields() {
        let (manager, binder) = setup();
        let pid = join(&manager, "Ballata", "ann");
        let mut mock = mock_session("s1");
        mock.expect_send_reliable().returning(|m: &str| {
            if m.contains("pong") {
                let v: Value = serde_json::from_str(m).unwrap();
                assert_eq!(v["id"], 7);
                assert_eq!(v["t"], 123);
            }
            true
        });
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"bind","participant_id":"{}","room":"Ballata"}}"#, pid),
        );
        binder.on_message(&*session, r#"{"type":"ping","id":7,"t":123}"#);
        manager.shutdown();
    }

    #[test]
    fn gain_and_mute_route_to_the_room() {
        let (manager, binder) = setup();
        let listener = join(&manager, "Dolce", "ann");
        let source = join(&manager, "Dolce", "ben");
        let mut mock = mock_session("s1");
        mock.expect_send_reliable().returning(|_| true);
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"bind","participant_id":"{}","room":"Dolce"}}"#, listener),
        );
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"gain","participant_id":"{}","value":0.25}}"#, source),
        );
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"mute","participant_id":"{}","muted":true}}"#, source),
        );
        let room = manager.get_room("Dolce").unwrap();
        let entry = room.get_gain_entry(&listener, &source);
        assert_eq!(entry.gain, 0.25);
        assert!(entry.muted);
        manager.shutdown();
    }

    #[test]
    fn close_of_bound_session_leaves_the_room() {
        let (manager, binder) = setup();
        let pid = join(&manager, "Espressivo", "ann");
        let mut mock = mock_session("s1");
        mock.expect_send_reliable().returning(|_| true);
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"bind","participant_id":"{}","room":"Espressivo"}}"#, pid),
        );
        assert_eq!(manager.get_room("Espressivo").unwrap().participant_count(), 1);
        binder.on_session_close(&*session);
        assert_eq!(binder.bound_count(), 0);
        assert_eq!(manager.get_room("Espressivo").unwrap().participant_count(), 0);
        manager.shutdown();
    }

    #[test]
    fn stale_pending_sessions_get_reaped() {
        let manager = Arc::new(RoomManager::new(ManagerSettings::default()));
        manager.initialize_default_rooms();
        let binder = SessionBinder::new(Arc::clone(&manager), Duration::from_millis(10));
        let session = Arc::new(mock_session("s1"));
        binder.on_session_open(session);
        assert_eq!(binder.reap_stale_pending(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(binder.reap_stale_pending(), 1);
        assert_eq!(binder.pending_count(), 0);
        manager.shutdown();
    }

    #[test]
    fn server_pings_feed_the_tracker() {
        let (manager, binder) = setup();
        let pid = join(&manager, "Fortepiano", "ann");
        let mut mock = mock_session("s1");
        mock.expect_send_reliable().returning(|_| true);
        let session = Arc::new(mock);
        binder.on_session_open(session.clone());
        binder.on_message(
            &*session,
            &format!(r#"{{"type":"bind","participant_id":"{}","room":"Fortepiano"}}"#, pid),
        );
        assert_eq!(binder.send_pings(), 1);
        let tracker = manager.latency_tracker();
        assert_eq!(tracker.get_stats(&pid).packets_sent, 1);
        // the client answers
        binder.on_message(&*session, r#"{"type":"pong","id":0,"t":0.0}"#);
        let stats = tracker.get_stats(&pid);
        assert_eq!(stats.packets_received, 1);
        assert!(stats.rtt_ms >= 0.0);
        manager.shutdown();
    }
}
