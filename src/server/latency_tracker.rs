//! per participant latency and loss telemetry
//!
//! Round trips are measured with reliable-channel ping/pong: stamp the
//! send with [`LatencyTracker::record_ping`], match the reply in
//! [`LatencyTracker::record_pong`].  RTT and jitter are smoothed with an
//! EWMA so one congested round trip does not whipsaw the display.  The
//! room's RT thread also parks its last mix-cycle duration here, in a
//! single atomic so the hot path never takes the table mutex.
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// EWMA smoothing factor, same spirit as TCP's RTT estimator.
const EWMA_ALPHA: f64 = 0.125;
/// Pings unanswered for this long are forgotten to bound the table.
const PENDING_PING_MAX_AGE: Duration = Duration::from_secs(5);
/// Returned by record_pong when the ping was never ours to begin with.
pub const RTT_UNKNOWN: f64 = -1.0;

/// Snapshot handed to the ops surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// fraction of probes that never came back, 0.0 - 1.0
    pub loss: f64,
    pub last_mix_us: f64,
}

impl LatencyStats {
    /// Estimated one-way network latency.
    pub fn one_way_network_ms(&self) -> f64 {
        self.rtt_ms / 2.0
    }
}

struct ParticipantLatency {
    pending_pings: HashMap<u64, Instant>,
    rtt_ewma: f64,
    jitter_ewma: f64,
    packets_sent: u64,
    packets_received: u64,
}

impl ParticipantLatency {
    fn new() -> ParticipantLatency {
        ParticipantLatency {
            pending_pings: HashMap::new(),
            rtt_ewma: 0.0,
            jitter_ewma: 0.0,
            packets_sent: 0,
            packets_received: 0,
        }
    }
}

pub struct LatencyTracker {
    participants: Mutex<HashMap<String, ParticipantLatency>>,
    // f64 bits, so the RT thread can store without a lock
    last_mix_us: AtomicU64,
}

impl LatencyTracker {
    pub fn new() -> LatencyTracker {
        LatencyTracker {
            participants: Mutex::new(HashMap::new()),
            last_mix_us: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Stamp an outgoing ping to `participant_id`.
    pub fn record_ping(&self, participant_id: &str, ping_id: u64) -> () {
        let mut participants = self.participants.lock().unwrap();
        let p = participants
            .entry(String::from(participant_id))
            .or_insert_with(ParticipantLatency::new);
        p.pending_pings.insert(ping_id, Instant::now());
        p.packets_sent += 1;
    }

    /// Match a pong against its pending ping and fold the measured RTT
    /// into the EWMAs.  Returns the raw RTT in milliseconds, or
    /// [`RTT_UNKNOWN`] for a pong we have no ping for.
    pub fn record_pong(&self, participant_id: &str, ping_id: u64, _client_timestamp: f64) -> f64 {
        let mut participants = self.participants.lock().unwrap();
        let p = match participants.get_mut(participant_id) {
            Some(p) => p,
            None => return RTT_UNKNOWN,
        };
        let sent_at = match p.pending_pings.remove(&ping_id) {
            Some(t) => t,
            None => return RTT_UNKNOWN,
        };
        let now = Instant::now();
        let rtt = now.duration_since(sent_at).as_secs_f64() * 1000.0;
        p.packets_received += 1;

        if p.rtt_ewma == 0.0 {
            // first sample seeds the average
            p.rtt_ewma = rtt;
        } else {
            let diff = (rtt - p.rtt_ewma).abs();
            p.jitter_ewma = (1.0 - EWMA_ALPHA) * p.jitter_ewma + EWMA_ALPHA * diff;
            p.rtt_ewma = (1.0 - EWMA_ALPHA) * p.rtt_ewma + EWMA_ALPHA * rtt;
        }

        // forget probes nobody is answering
        p.pending_pings
            .retain(|_, sent| now.duration_since(*sent) < PENDING_PING_MAX_AGE);

        rtt
    }

    /// Called by the RT mixer thread after every cycle.
    pub fn record_mix_duration(&self, microseconds: f64) -> () {
        self.last_mix_us
            .store(microseconds.to_bits(), Ordering::Relaxed);
    }

    pub fn last_mix_us(&self) -> f64 {
        f64::from_bits(self.last_mix_us.load(Ordering::Relaxed))
    }

    pub fn get_stats(&self, participant_id: &str) -> LatencyStats {
        let participants = self.participants.lock().unwrap();
        let mut stats = LatencyStats::default();
        stats.last_mix_us = self.last_mix_us();
        if let Some(p) = participants.get(participant_id) {
            stats.rtt_ms = p.rtt_ewma;
            stats.jitter_ms = p.jitter_ewma;
            stats.packets_sent = p.packets_sent;
            stats.packets_received = p.packets_received;
            if p.packets_sent > 0 {
                stats.loss = 1.0 - (p.packets_received as f64 / p.packets_sent as f64);
            }
        }
        stats
    }

    /// Number of probes still waiting on an answer.
    pub fn pending_ping_count(&self, participant_id: &str) -> usize {
        let participants = self.participants.lock().unwrap();
        participants
            .get(participant_id)
            .map(|p| p.pending_pings.len())
            .unwrap_or(0)
    }

    pub fn remove_participant(&self, participant_id: &str) -> () {
        self.participants.lock().unwrap().remove(participant_id);
    }
}
