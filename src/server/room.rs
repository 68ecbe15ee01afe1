//! A rehearsal room: one mixer, one participant table, one RT thread.
//!
//! The RT thread is event driven.  The receive path counts arriving
//! frames and kicks the wakeup once everybody has delivered one; a 3ms
//! timeout on the wait catches stragglers and keeps cadence when a
//! client goes quiet.  The thread never blocks on anything else: table
//! lookups are short mutex holds and every network send happens after
//! the lock is gone.
//!
//! Two-participant rooms never touch the mixer at all.  With exactly one
//! listener there is nothing to sum, so the receive path forwards the
//! datagram straight to the other side, rewriting only the sequence
//! number (and scaling samples when the listener has trimmed the gain).
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::audio_packet::{AudioFrame, AUDIO_PACKET_SIZE, SAMPLES_PER_FRAME};
use crate::common::control_message::{ControlMessage, ParticipantEntry};
use crate::common::transport::TransportSession;
use crate::server::latency_tracker::LatencyTracker;
use crate::sound::mixer::{GainEntry, Mixer, MixScratch};
use crate::utils;

/// Slightly more than one render quantum, to catch stragglers.
const MIX_WAIT_TIMEOUT: Duration = Duration::from_millis(3);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoomStatus {
    /// no password, anyone can join
    Open,
    /// somebody set a password
    Claimed,
    /// at capacity
    Full,
}

/// Reaper thresholds, configurable through settings.json.
#[derive(Debug, Clone, Copy)]
pub struct RoomTimeouts {
    /// how long a joined-but-never-bound participant may linger
    pub unbound: Duration,
    /// how long a bound participant may sit with no audio either way
    pub inactivity: Duration,
}

impl Default for RoomTimeouts {
    fn default() -> RoomTimeouts {
        RoomTimeouts {
            unbound: Duration::from_secs(30),
            inactivity: Duration::from_secs(60),
        }
    }
}

pub struct ParticipantInfo {
    pub id: String,
    pub alias: String,
}

struct Participant {
    alias: String,
    session: Option<Arc<dyn TransportSession>>,
    output_sequence: u32,
    join_time: Instant,
    // steady-clock nanos, 0 = never
    last_audio_received_ns: u64,
    last_audio_sent_ns: u64,
}

impl Participant {
    fn next_output_seq(&mut self) -> u32 {
        self.output_sequence = self.output_sequence.wrapping_add(1);
        self.output_sequence
    }
}

/// Cross-thread kick for the RT loop.  Condvar with a flag; spurious
/// wakeups are harmless because a cycle with no input produces nothing.
struct Wakeup {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    fn new() -> Wakeup {
        Wakeup {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
    fn signal(&self) -> () {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cond.notify_one();
    }
    fn wait_timeout(&self, timeout: Duration) -> () {
        let mut flag = self.flag.lock().unwrap();
        if !*flag {
            let (guard, _) = self.cond.wait_timeout(flag, timeout).unwrap();
            flag = guard;
        }
        *flag = false;
    }
}

pub struct Room {
    name: String,
    max_participants: usize,
    timeouts: RoomTimeouts,
    mixer: Mixer,
    participants: Mutex<HashMap<String, Participant>>,
    password: Mutex<String>,
    tracker: Arc<LatencyTracker>,
    wakeup: Wakeup,
    frames_received: AtomicU32,
    running: AtomicBool,
    rt_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Room {
    pub fn new(
        name: &str,
        max_participants: usize,
        ring_capacity: usize,
        timeouts: RoomTimeouts,
        tracker: Arc<LatencyTracker>,
    ) -> Room {
        Room {
            name: String::from(name),
            max_participants,
            timeouts,
            mixer: Mixer::new(max_participants, ring_capacity),
            participants: Mutex::new(HashMap::new()),
            password: Mutex::new(String::new()),
            tracker,
            wakeup: Wakeup::new(),
            frames_received: AtomicU32::new(0),
            running: AtomicBool::new(false),
            rt_thread: Mutex::new(None),
        }
    }

    /// Spin up the RT mixer thread.  Idempotent.
    pub fn start(self: &Arc<Self>) -> () {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let room = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("mix-{}", self.name))
            .spawn(move || room.rt_thread_func())
            .unwrap();
        *self.rt_thread.lock().unwrap() = Some(handle);
    }

    /// Signal the RT thread and join it.  Idempotent.
    pub fn stop(&self) -> () {
        self.running.store(false, Ordering::Release);
        self.wakeup.signal();
        let handle = self.rt_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Put a participant in the room.  `session` may be absent for an
    /// HTTP join; the binder attaches one later.  False when the room is
    /// full or the id is already present.
    pub fn add_participant(
        &self,
        id: &str,
        alias: &str,
        session: Option<Arc<dyn TransportSession>>,
    ) -> bool {
        let others: Vec<Arc<dyn TransportSession>>;
        let state_msg: ControlMessage;
        {
            let mut participants = self.participants.lock().unwrap();
            if participants.len() >= self.max_participants {
                return false;
            }
            if participants.contains_key(id) {
                return false;
            }
            participants.insert(
                String::from(id),
                Participant {
                    alias: String::from(alias),
                    session: session.clone(),
                    output_sequence: 0,
                    join_time: Instant::now(),
                    last_audio_received_ns: 0,
                    last_audio_sent_ns: 0,
                },
            );
            self.mixer.add_participant(id);
            others = participants
                .iter()
                .filter(|(pid, _)| pid.as_str() != id)
                .filter_map(|(_, p)| p.session.clone())
                .collect();
            state_msg = Self::room_state_locked(&participants);
        }

        // everybody already here learns about the newcomer
        let joined = ControlMessage::ParticipantJoined {
            id: String::from(id),
            name: String::from(alias),
        }
        .to_string();
        for s in &others {
            s.send_reliable(&joined);
        }
        // and the newcomer learns who is here
        if let Some(s) = session {
            s.send_reliable(&state_msg.to_string());
        }
        info!("room {}: {} ({}) joined", self.name, alias, id);
        true
    }

    /// Wire a transport session onto a participant that joined over
    /// HTTP.  False if the id is unknown (reaped, typo, wrong room).
    pub fn attach_session(&self, id: &str, session: Arc<dyn TransportSession>) -> bool {
        let state_msg: ControlMessage;
        {
            let mut participants = self.participants.lock().unwrap();
            match participants.get_mut(id) {
                Some(p) => p.session = Some(Arc::clone(&session)),
                None => return false,
            }
            state_msg = Self::room_state_locked(&participants);
        }
        session.send_reliable(&state_msg.to_string());
        debug!("room {}: session attached for {}", self.name, id);
        true
    }

    /// Drop a participant, tell the others.  Second call is a no-op.
    /// The password goes with the last person out.
    pub fn remove_participant(&self, id: &str) -> () {
        let others: Vec<Arc<dyn TransportSession>>;
        let now_empty;
        {
            let mut participants = self.participants.lock().unwrap();
            if participants.remove(id).is_none() {
                return;
            }
            others = participants.values().filter_map(|p| p.session.clone()).collect();
            now_empty = participants.is_empty();
        }
        self.mixer.remove_participant(id);
        self.tracker.remove_participant(id);
        if now_empty {
            self.clear_password();
        }
        let left = ControlMessage::ParticipantLeft {
            id: String::from(id),
        }
        .to_string();
        for s in &others {
            s.send_reliable(&left);
        }
        info!("room {}: {} left", self.name, id);
    }

    /// Receive path entry for one audio datagram from `sender_id`.
    pub fn on_audio_received(&self, sender_id: &str, data: &[u8]) -> () {
        if !AudioFrame::is_valid_len(data.len()) {
            return;
        }

        // Fast path setup: with exactly two participants the only mix is
        // "the other one", so resolve them under the lock and get out.
        let count;
        let mut fast_target: Option<(String, Arc<dyn TransportSession>, u32)> = None;
        {
            let mut participants = self.participants.lock().unwrap();
            count = participants.len();
            match participants.get_mut(sender_id) {
                Some(p) => p.last_audio_received_ns = utils::get_nano_time(),
                None => return,
            }
            if count == 2 {
                for (pid, p) in participants.iter_mut() {
                    if pid != sender_id {
                        let seq = p.next_output_seq();
                        p.last_audio_sent_ns = utils::get_nano_time();
                        if let Some(session) = &p.session {
                            fast_target = Some((pid.clone(), Arc::clone(session), seq));
                        }
                        break;
                    }
                }
            }
        }

        if count == 2 {
            if let Some((target_id, session, seq)) = fast_target {
                self.forward_fast_path(sender_id, &target_id, &session, seq, data);
            }
            return;
        }

        // General path: queue for the mixer, wake it once the whole
        // room has delivered this quantum.
        let frame = match AudioFrame::deserialize(data) {
            Ok(f) => f,
            Err(_) => return,
        };
        self.mixer.push_input(sender_id, &frame);
        let received = self.frames_received.fetch_add(1, Ordering::AcqRel) + 1;
        if received as usize >= count {
            self.wakeup.signal();
        }
    }

    /// Two-participant bypass.  Unity gain is a copy with the sequence
    /// prefix rewritten; anything else is a decode, scale, re-encode.
    /// The sender's timestamp rides through untouched either way.
    fn forward_fast_path(
        &self,
        sender_id: &str,
        target_id: &str,
        session: &Arc<dyn TransportSession>,
        seq: u32,
        data: &[u8],
    ) -> () {
        let entry = self.mixer.get_gain_entry(target_id, sender_id);
        if entry.muted || entry.gain <= 0.0 {
            return;
        }

        let mut buf = [0u8; AUDIO_PACKET_SIZE];
        if entry.gain == 1.0 {
            buf.copy_from_slice(&data[0..AUDIO_PACKET_SIZE]);
            LittleEndian::write_u32(&mut buf[0..4], seq);
        } else {
            let mut frame = match AudioFrame::deserialize(data) {
                Ok(f) => f,
                Err(_) => return,
            };
            for s in frame.samples.iter_mut() {
                let scaled = (*s as f32 * entry.gain).round() as i32;
                *s = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            frame.sequence = seq;
            frame.serialize(&mut buf);
        }
        session.send_datagram(&buf);
    }

    pub fn set_gain(&self, listener_id: &str, source_id: &str, gain: f32) -> () {
        self.mixer.set_gain(listener_id, source_id, gain);
    }

    pub fn set_mute(&self, listener_id: &str, source_id: &str, muted: bool) -> () {
        self.mixer.set_mute(listener_id, source_id, muted);
    }

    pub fn get_gain_entry(&self, listener_id: &str, source_id: &str) -> GainEntry {
        self.mixer.get_gain_entry(listener_id, source_id)
    }

    pub fn claim(&self, password: &str) -> bool {
        let mut current = self.password.lock().unwrap();
        *current = String::from(password);
        true
    }

    /// True when the room has no password, or the guess matches.
    pub fn check_password(&self, password: &str) -> bool {
        let current = self.password.lock().unwrap();
        current.is_empty() || *current == password
    }

    pub fn clear_password(&self) -> () {
        self.password.lock().unwrap().clear();
    }

    /// Sweep out participants that went stale.  Somebody who joined but
    /// never bound a session gets `timeouts.unbound` from join; a bound
    /// participant in company gets `timeouts.inactivity` from their last
    /// audio in either direction (or from join if audio never flowed).
    /// Somebody alone in a room can idle forever.
    pub fn reap_stale_participants(&self) -> usize {
        let mut to_reap: Vec<String> = Vec::new();
        let now = Instant::now();
        let now_ns = utils::get_nano_time();
        {
            let participants = self.participants.lock().unwrap();
            let count = participants.len();
            for (id, p) in participants.iter() {
                if p.session.is_none() {
                    if now.duration_since(p.join_time) >= self.timeouts.unbound {
                        to_reap.push(id.clone());
                    }
                    continue;
                }
                if count <= 1 {
                    continue;
                }
                let last_activity = p.last_audio_received_ns.max(p.last_audio_sent_ns);
                if last_activity == 0 {
                    if now.duration_since(p.join_time) >= self.timeouts.inactivity {
                        to_reap.push(id.clone());
                    }
                } else if now_ns.saturating_sub(last_activity)
                    >= self.timeouts.inactivity.as_nanos() as u64
                {
                    to_reap.push(id.clone());
                }
            }
        }
        for id in &to_reap {
            info!("room {}: reaping stale participant {}", self.name, id);
            self.remove_participant(id);
        }
        to_reap.len()
    }

    /// Reliable-channel fanout to every bound participant.
    pub fn broadcast_reliable(&self, message: &str) -> () {
        let sessions: Vec<Arc<dyn TransportSession>> = {
            let participants = self.participants.lock().unwrap();
            participants.values().filter_map(|p| p.session.clone()).collect()
        };
        for s in &sessions {
            s.send_reliable(message);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().unwrap().len()
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    pub fn is_empty(&self) -> bool {
        self.participant_count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.participant_count() >= self.max_participants
    }

    pub fn status(&self) -> RoomStatus {
        if self.is_full() {
            return RoomStatus::Full;
        }
        if self.password.lock().unwrap().is_empty() {
            RoomStatus::Open
        } else {
            RoomStatus::Claimed
        }
    }

    pub fn get_participants(&self) -> Vec<ParticipantInfo> {
        let participants = self.participants.lock().unwrap();
        participants
            .iter()
            .map(|(id, p)| ParticipantInfo {
                id: id.clone(),
                alias: p.alias.clone(),
            })
            .collect()
    }

    fn room_state_locked(participants: &HashMap<String, Participant>) -> ControlMessage {
        ControlMessage::RoomState {
            participants: participants
                .iter()
                .map(|(id, p)| ParticipantEntry {
                    id: id.clone(),
                    name: p.alias.clone(),
                })
                .collect(),
        }
    }

    fn rt_thread_func(&self) -> () {
        if let Err(e) = utils::set_realtime_priority() {
            warn!("room {}: running without RT priority ({})", self.name, e);
        }
        if let Err(e) = utils::pin_to_core(1) {
            debug!("room {}: not pinned ({})", self.name, e);
        }

        let mut scratch: MixScratch = self.mixer.make_scratch();
        let mut pending_sends: Vec<(Arc<dyn TransportSession>, [u8; AUDIO_PACKET_SIZE])> =
            Vec::with_capacity(self.max_participants);

        while self.running.load(Ordering::Acquire) {
            self.wakeup.wait_timeout(MIX_WAIT_TIMEOUT);
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.frames_received.store(0, Ordering::Release);
            let cycle_start = Instant::now();
            self.mixer.mix_cycle(&mut scratch);
            self.tracker
                .record_mix_duration(cycle_start.elapsed().as_secs_f64() * 1_000_000.0);
            self.send_outputs(&mut pending_sends);
        }
    }

    /// Drain one output frame per participant.  Serialization happens
    /// under the table lock (sequence counters live there); the sends do
    /// not.
    fn send_outputs(
        &self,
        pending: &mut Vec<(Arc<dyn TransportSession>, [u8; AUDIO_PACKET_SIZE])>,
    ) -> () {
        pending.clear();
        let mut frame = AudioFrame::new();
        {
            let mut participants = self.participants.lock().unwrap();
            for (id, p) in participants.iter_mut() {
                if self.mixer.pop_output(id, &mut frame) {
                    p.last_audio_sent_ns = utils::get_nano_time();
                    frame.sequence = p.next_output_seq();
                    frame.timestamp = frame.sequence.wrapping_mul(SAMPLES_PER_FRAME as u32);
                    if let Some(session) = &p.session {
                        let mut buf = [0u8; AUDIO_PACKET_SIZE];
                        frame.serialize(&mut buf);
                        pending.push((Arc::clone(session), buf));
                    }
                }
            }
        }
        for (session, buf) in pending.iter() {
            session.send_datagram(buf);
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.stop();
    }
}
