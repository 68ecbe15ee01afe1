//! owns every room in the process and the lobby-facing operations
//!
//! The sixteen rooms are created once at startup and live until
//! shutdown; nothing here ever adds or deletes a room at runtime.  The
//! manager also runs the reaper (one background thread sweeping all
//! rooms for stale participants) and rate limits vacate requests per
//! requesting address.
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::control_message::ControlMessage;
use crate::common::transport::TransportSession;
use crate::server::latency_tracker::LatencyTracker;
use crate::server::room::{Room, RoomStatus, RoomTimeouts};
use crate::server::room_names::DEFAULT_ROOMS;
use crate::sound::frame_ring::DEFAULT_RING_CAPACITY;

/// Everything tunable about the manager, bridged from settings.json by
/// the engine.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub max_participants: usize,
    pub ring_capacity: usize,
    pub timeouts: RoomTimeouts,
    pub vacate_cooldown: Duration,
    pub reaper_sweep_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> ManagerSettings {
        ManagerSettings {
            max_participants: 4,
            ring_capacity: DEFAULT_RING_CAPACITY,
            timeouts: RoomTimeouts::default(),
            vacate_cooldown: Duration::from_secs(24 * 60 * 60),
            reaper_sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum JoinResult {
    Success { participant_id: String },
    RoomNotFound,
    RoomFull,
    PasswordRequired,
    PasswordIncorrect,
}

#[derive(Debug, PartialEq)]
pub enum VacateResult {
    Sent,
    RoomNotFound,
    RoomEmpty,
    CooldownActive,
}

/// One row of the lobby listing.
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub participant_count: usize,
    pub max_participants: usize,
    pub claimed: bool,
}

/// Extra work the reaper does each sweep (the engine hooks the session
/// binder's stale-pending prune in here).
pub type PendingSweep = Box<dyn Fn() -> usize + Send + Sync>;

pub struct RoomManager {
    settings: ManagerSettings,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    // (source_ip, room_name) -> last accepted vacate request
    vacate_cooldowns: Mutex<HashMap<(String, String), Instant>>,
    tracker: Arc<LatencyTracker>,
    reaper_running: AtomicBool,
    reaper_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RoomManager {
    pub fn new(settings: ManagerSettings) -> RoomManager {
        RoomManager {
            settings,
            rooms: Mutex::new(HashMap::new()),
            vacate_cooldowns: Mutex::new(HashMap::new()),
            tracker: Arc::new(LatencyTracker::new()),
            reaper_running: AtomicBool::new(false),
            reaper_thread: Mutex::new(None),
        }
    }

    /// Create the fixed room set and start each room's mixer thread.
    pub fn initialize_default_rooms(&self) -> () {
        let mut rooms = self.rooms.lock().unwrap();
        for def in DEFAULT_ROOMS.iter() {
            let room = Arc::new(Room::new(
                def.name,
                self.settings.max_participants,
                self.settings.ring_capacity,
                self.settings.timeouts,
                Arc::clone(&self.tracker),
            ));
            room.start();
            rooms.insert(String::from(def.name), room);
        }
        info!("initialized {} rooms", rooms.len());
    }

    pub fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().unwrap().get(name).cloned()
    }

    /// Lobby listing, sorted by name (which is also creation order).
    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.lock().unwrap();
        let mut result: Vec<RoomInfo> = rooms
            .values()
            .map(|room| RoomInfo {
                name: String::from(room.name()),
                participant_count: room.participant_count(),
                max_participants: room.max_participants(),
                claimed: room.status() == RoomStatus::Claimed,
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Join a participant to a room, enforcing capacity and password.
    /// The session is optional because the HTTP lobby joins first and
    /// the transport binds afterwards.
    pub fn join_room(
        &self,
        room_name: &str,
        alias: &str,
        password: &str,
        session: Option<Arc<dyn TransportSession>>,
    ) -> JoinResult {
        let room = match self.get_room(room_name) {
            Some(r) => r,
            None => return JoinResult::RoomNotFound,
        };
        if room.is_full() {
            return JoinResult::RoomFull;
        }
        if room.status() == RoomStatus::Claimed {
            if password.is_empty() {
                return JoinResult::PasswordRequired;
            }
            if !room.check_password(password) {
                return JoinResult::PasswordIncorrect;
            }
        }

        let participant_id = generate_participant_id();
        let alias: String = alias.chars().take(32).collect();
        if !room.add_participant(&participant_id, &alias, session) {
            return JoinResult::RoomFull;
        }
        JoinResult::Success { participant_id }
    }

    pub fn leave_room(&self, room_name: &str, participant_id: &str) -> () {
        if let Some(room) = self.get_room(room_name) {
            room.remove_participant(participant_id);
        }
    }

    pub fn claim_room(&self, room_name: &str, password: &str) -> bool {
        match self.get_room(room_name) {
            Some(room) => room.claim(password),
            None => false,
        }
    }

    /// Ask the current occupants of a room to wrap it up.  One request
    /// per requester per room per cooldown window.
    pub fn vacate_request(&self, room_name: &str, source_ip: &str) -> VacateResult {
        let room = match self.get_room(room_name) {
            Some(r) => r,
            None => return VacateResult::RoomNotFound,
        };
        if room.is_empty() {
            return VacateResult::RoomEmpty;
        }

        {
            let mut cooldowns = self.vacate_cooldowns.lock().unwrap();
            let key = (String::from(source_ip), String::from(room_name));
            if let Some(last) = cooldowns.get(&key) {
                if last.elapsed() < self.settings.vacate_cooldown {
                    return VacateResult::CooldownActive;
                }
            }
            cooldowns.insert(key, Instant::now());
        }

        room.broadcast_reliable(&ControlMessage::VacateRequest.to_string());
        info!("vacate request for {} from {}", room_name, source_ip);
        VacateResult::Sent
    }

    pub fn latency_tracker(&self) -> Arc<LatencyTracker> {
        Arc::clone(&self.tracker)
    }

    /// Start the background sweeper.  Sleeps in 100ms chunks so shutdown
    /// stays responsive, sweeps rooms every `reaper_sweep_interval`, and
    /// runs `pending_sweep` (if any) on the same cadence.
    pub fn start_reaper(self: &Arc<Self>, pending_sweep: Option<PendingSweep>) -> () {
        if self.reaper_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(String::from("reaper"))
            .spawn(move || manager.reaper_thread_func(pending_sweep))
            .unwrap();
        *self.reaper_thread.lock().unwrap() = Some(handle);
        info!("participant reaper started");
    }

    pub fn stop_reaper(&self) -> () {
        self.reaper_running.store(false, Ordering::Release);
        let handle = self.reaper_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Stop the reaper, then every room in turn.
    pub fn shutdown(&self) -> () {
        self.stop_reaper();
        let rooms: Vec<Arc<Room>> = self.rooms.lock().unwrap().values().cloned().collect();
        for room in rooms {
            room.stop();
        }
        info!("room manager shut down");
    }

    fn reaper_thread_func(&self, pending_sweep: Option<PendingSweep>) -> () {
        let chunk = Duration::from_millis(100).min(self.settings.reaper_sweep_interval);
        let mut slept = Duration::ZERO;
        while self.reaper_running.load(Ordering::Acquire) {
            thread::sleep(chunk);
            slept += chunk;
            if slept < self.settings.reaper_sweep_interval {
                continue;
            }
            slept = Duration::ZERO;

            let snapshot: Vec<Arc<Room>> =
                self.rooms.lock().unwrap().values().cloned().collect();
            let mut reaped = 0;
            for room in snapshot {
                reaped += room.reap_stale_participants();
            }
            if let Some(sweep) = &pending_sweep {
                reaped += sweep();
            }
            if reaped > 0 {
                warn!("reaper removed {} stale entries", reaped);
            }
        }
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}

/// 128 random bits as lowercase hex.
fn generate_participant_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
