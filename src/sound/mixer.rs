//!
//! mixer used to build each listener their own blend of the room
//!
//! Every participant hears the sum of every *other* participant, scaled
//! by that listener's per-source gain and mute settings.  The heavy part
//! runs on the room's RT thread via [`Mixer::mix_cycle`]; everything it
//! needs is snapshotted up front so the cycle itself never allocates and
//! never holds a lock while touching samples.
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::audio_packet::{AudioFrame, SAMPLES_PER_FRAME};
use crate::sound::frame_ring::FrameRing;

/// How loud one source is in one listener's mix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainEntry {
    pub gain: f32,
    pub muted: bool,
}

impl Default for GainEntry {
    fn default() -> GainEntry {
        GainEntry {
            gain: 1.0,
            muted: false,
        }
    }
}

/// Per-participant queues.  The input ring is fed by the network receive
/// path and drained by the mixer; the output ring is fed by the mixer and
/// drained by the send path.  Held by `Arc` because the rings cannot move
/// once threads are pushing into them.
pub struct ParticipantMixState {
    id: String,
    input: FrameRing,
    output: FrameRing,
}

impl ParticipantMixState {
    fn new(id: &str, ring_capacity: usize) -> ParticipantMixState {
        ParticipantMixState {
            id: String::from(id),
            input: FrameRing::new(ring_capacity),
            output: FrameRing::new(ring_capacity),
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Scratch storage for one mix cycle, owned by the RT thread.
///
/// Sized once at room construction; the cycle reuses it so the hot path
/// does no allocation.
pub struct MixScratch {
    states: Vec<Arc<ParticipantMixState>>,
    inputs: Vec<[i16; SAMPLES_PER_FRAME]>,
    has_input: Vec<bool>,
    gains: HashMap<String, HashMap<String, GainEntry>>,
}

impl MixScratch {
    fn new(max_participants: usize) -> MixScratch {
        MixScratch {
            states: Vec::with_capacity(max_participants),
            inputs: vec![[0; SAMPLES_PER_FRAME]; max_participants],
            has_input: vec![false; max_participants],
            gains: HashMap::new(),
        }
    }
}

pub struct Mixer {
    max_participants: usize,
    ring_capacity: usize,
    participants: Mutex<HashMap<String, Arc<ParticipantMixState>>>,
    // gains[listener][source]
    gains: Mutex<HashMap<String, HashMap<String, GainEntry>>>,
}

impl Mixer {
    pub fn new(max_participants: usize, ring_capacity: usize) -> Mixer {
        Mixer {
            max_participants,
            ring_capacity,
            participants: Mutex::new(HashMap::new()),
            gains: Mutex::new(HashMap::new()),
        }
    }

    /// Scratch sized for this mixer.  Create it on the thread that will
    /// run the cycles.
    pub fn make_scratch(&self) -> MixScratch {
        MixScratch::new(self.max_participants)
    }

    /// Not called from the RT thread.
    pub fn add_participant(&self, id: &str) -> bool {
        let mut participants = self.participants.lock().unwrap();
        if participants.len() >= self.max_participants {
            return false;
        }
        if participants.contains_key(id) {
            return false;
        }
        participants.insert(
            String::from(id),
            Arc::new(ParticipantMixState::new(id, self.ring_capacity)),
        );
        true
    }

    /// Not called from the RT thread.  Also drops every gain entry that
    /// names `id`, from either side.
    pub fn remove_participant(&self, id: &str) -> () {
        self.participants.lock().unwrap().remove(id);

        let mut gains = self.gains.lock().unwrap();
        gains.remove(id);
        for source_map in gains.values_mut() {
            source_map.remove(id);
        }
    }

    /// How loud `source_id` sounds to `listener_id`.  Clamped to [0, 1].
    pub fn set_gain(&self, listener_id: &str, source_id: &str, gain: f32) -> () {
        let mut gains = self.gains.lock().unwrap();
        gains
            .entry(String::from(listener_id))
            .or_default()
            .entry(String::from(source_id))
            .or_default()
            .gain = gain.clamp(0.0, 1.0);
    }

    pub fn set_mute(&self, listener_id: &str, source_id: &str, muted: bool) -> () {
        let mut gains = self.gains.lock().unwrap();
        gains
            .entry(String::from(listener_id))
            .or_default()
            .entry(String::from(source_id))
            .or_default()
            .muted = muted;
    }

    /// Snapshot read used by the two-participant fast path.  Absent
    /// entries read as unity gain, unmuted.
    pub fn get_gain_entry(&self, listener_id: &str, source_id: &str) -> GainEntry {
        let gains = self.gains.lock().unwrap();
        gains
            .get(listener_id)
            .and_then(|m| m.get(source_id))
            .copied()
            .unwrap_or_default()
    }

    /// Producer side of a participant's input ring.  Called by the
    /// network receive path; false means unknown participant or a full
    /// ring (the frame is gone either way).
    pub fn push_input(&self, participant_id: &str, frame: &AudioFrame) -> bool {
        let participants = self.participants.lock().unwrap();
        match participants.get(participant_id) {
            Some(state) => state.input.try_push(frame),
            None => false,
        }
    }

    /// Consumer side of a participant's output ring, for the send path.
    pub fn pop_output(&self, participant_id: &str, out: &mut AudioFrame) -> bool {
        let participants = self.participants.lock().unwrap();
        match participants.get(participant_id) {
            Some(state) => state.output.try_pop(out),
            None => false,
        }
    }

    /// One mix step.  Runs on the RT thread and must not allocate; all
    /// mutable state lives in `scratch`.
    pub fn mix_cycle(&self, scratch: &mut MixScratch) -> () {
        // Snapshot the participant handles, one short lock
        scratch.states.clear();
        {
            let participants = self.participants.lock().unwrap();
            for state in participants.values() {
                scratch.states.push(Arc::clone(state));
            }
        }
        let n = scratch.states.len();
        if n == 0 {
            return;
        }

        // Pull at most one frame per participant this cycle
        let mut frame = AudioFrame::new();
        for i in 0..n {
            scratch.has_input[i] = scratch.states[i].input.try_pop(&mut frame);
            if scratch.has_input[i] {
                scratch.inputs[i] = frame.samples;
            }
        }

        // Snapshot the gain matrix
        {
            let gains = self.gains.lock().unwrap();
            scratch.gains.clone_from(&gains);
        }

        // Per listener: sum everyone else, saturate, queue for send
        for listener_idx in 0..n {
            let listener = &scratch.states[listener_idx];
            let listener_gains = scratch.gains.get(listener.id());

            let mut accum = [0i32; SAMPLES_PER_FRAME];
            let mut any_input = false;

            for source_idx in 0..n {
                if source_idx == listener_idx || !scratch.has_input[source_idx] {
                    continue;
                }
                let source_id = scratch.states[source_idx].id();
                let entry = listener_gains
                    .and_then(|m| m.get(source_id))
                    .copied()
                    .unwrap_or_default();
                if entry.muted || entry.gain <= 0.0 {
                    continue;
                }
                any_input = true;
                let samples = &scratch.inputs[source_idx];
                for s in 0..SAMPLES_PER_FRAME {
                    accum[s] += (samples[s] as f32 * entry.gain).round() as i32;
                }
            }

            // nobody to hear this cycle, produce nothing
            if !any_input {
                continue;
            }

            let mut output = AudioFrame::new();
            for s in 0..SAMPLES_PER_FRAME {
                output.samples[s] = accum[s].clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            // sequence and timestamp get stamped by the send path
            if !listener.output.try_push(&output) {
                debug!("output ring full for {}", listener.id());
            }
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().unwrap().len()
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod test_mixer {
    use super::*;

    fn make_frame(value: i16, seq: u32) -> AudioFrame {
        let mut frame = AudioFrame::new();
        frame.sequence = seq;
        frame.timestamp = seq * SAMPLES_PER_FRAME as u32;
        frame.samples = [value; SAMPLES_PER_FRAME];
        frame
    }

    fn mixer_with(ids: &[&str]) -> Mixer {
        let mixer = Mixer::new(4, 64);
        for id in ids {
            assert!(mixer.add_participant(id));
        }
        mixer
    }

    #[test]
    fn empty_mix_produces_nothing() {
        let mixer = mixer_with(&[]);
        let mut scratch = mixer.make_scratch();
        mixer.mix_cycle(&mut scratch);
    }

    #[test]
    fn single_participant_no_output() {
        // nobody else in the room, so there is nothing to hear
        let mixer = mixer_with(&["alice"]);
        let mut scratch = mixer.make_scratch();
        assert!(mixer.push_input("alice", &make_frame(1000, 1)));
        mixer.mix_cycle(&mut scratch);
        let mut out = AudioFrame::new();
        assert!(!mixer.pop_output("alice", &mut out));
    }

    #[test]
    fn two_participants_hear_each_other() {
        let mixer = mixer_with(&["alice", "bob"]);
        let mut scratch = mixer.make_scratch();
        assert!(mixer.push_input("alice", &make_frame(5000, 1)));
        assert!(mixer.push_input("bob", &make_frame(3000, 1)));
        mixer.mix_cycle(&mut scratch);

        let mut out = AudioFrame::new();
        assert!(mixer.pop_output("alice", &mut out));
        assert_eq!(out.samples, [3000; SAMPLES_PER_FRAME]);
        assert!(mixer.pop_output("bob", &mut out));
        assert_eq!(out.samples, [5000; SAMPLES_PER_FRAME]);
    }

    #[test]
    fn three_participants_sum() {
        let mixer = mixer_with(&["alice", "bob", "carol"]);
        let mut scratch = mixer.make_scratch();
        mixer.push_input("alice", &make_frame(1000, 1));
        mixer.push_input("bob", &make_frame(2000, 1));
        mixer.push_input("carol", &make_frame(3000, 1));
        mixer.mix_cycle(&mut scratch);

        let mut out = AudioFrame::new();
        assert!(mixer.pop_output("alice", &mut out));
        assert_eq!(out.samples[0], 5000); // bob + carol
        assert!(mixer.pop_output("bob", &mut out));
        assert_eq!(out.samples[0], 4000); // alice + carol
        assert!(mixer.pop_output("carol", &mut out));
        assert_eq!(out.samples[0], 3000); // alice + bob
    }

    #[test]
    fn sum_saturates_to_i16() {
        // two hot sources push the accumulator past i16 range
        let mixer = mixer_with(&["alice", "bob", "carol"]);
        let mut scratch = mixer.make_scratch();
        mixer.push_input("bob", &make_frame(30000, 1));
        mixer.push_input("carol", &make_frame(30000, 1));
        mixer.mix_cycle(&mut scratch);

        let mut out = AudioFrame::new();
        assert!(mixer.pop_output("alice", &mut out));
        assert_eq!(out.samples, [32767; SAMPLES_PER_FRAME]);
        // bob and carol each hear only the other, unclipped
        assert!(mixer.pop_output("bob", &mut out));
        assert_eq!(out.samples, [30000; SAMPLES_PER_FRAME]);
        assert!(mixer.pop_output("carol", &mut out));
        assert_eq!(out.samples, [30000; SAMPLES_PER_FRAME]);
    }

    #[test]
    fn gain_scales_the_source() {
        let mixer = mixer_with(&["alice", "bob"]);
        let mut scratch = mixer.make_scratch();
        mixer.set_gain("alice", "bob", 0.5);
        mixer.push_input("bob", &make_frame(10000, 1));
        mixer.mix_cycle(&mut scratch);

        let mut out = AudioFrame::new();
        assert!(mixer.pop_output("alice", &mut out));
        assert_eq!(out.samples[0], 5000);
    }

    #[test]
    fn gain_is_clamped() {
        let mixer = mixer_with(&["alice", "bob"]);
        mixer.set_gain("alice", "bob", 2.0);
        assert_eq!(mixer.get_gain_entry("alice", "bob").gain, 1.0);
        mixer.set_gain("alice", "bob", -0.5);
        assert_eq!(mixer.get_gain_entry("alice", "bob").gain, 0.0);
    }

    #[test]
    fn mute_silences_the_source() {
        let mixer = mixer_with(&["alice", "bob"]);
        let mut scratch = mixer.make_scratch();
        mixer.set_mute("alice", "bob", true);
        mixer.push_input("bob", &make_frame(10000, 1));
        mixer.mix_cycle(&mut scratch);

        // bob was alice's only source and he is muted, so no frame at all
        let mut out = AudioFrame::new();
        assert!(!mixer.pop_output("alice", &mut out));
    }

    #[test]
    fn gain_and_mute_mix() {
        // listener trims one source and mutes another
        let mixer = mixer_with(&["alice", "bob", "carol"]);
        let mut scratch = mixer.make_scratch();
        mixer.set_gain("alice", "bob", 0.5);
        mixer.set_mute("alice", "carol", true);
        mixer.push_input("bob", &make_frame(10000, 1));
        mixer.push_input("carol", &make_frame(20000, 1));
        mixer.mix_cycle(&mut scratch);

        let mut out = AudioFrame::new();
        assert!(mixer.pop_output("alice", &mut out));
        assert_eq!(out.samples, [5000; SAMPLES_PER_FRAME]);
    }

    #[test]
    fn remove_prunes_gain_entries() {
        let mixer = mixer_with(&["alice", "bob"]);
        mixer.set_gain("alice", "bob", 0.25);
        mixer.set_gain("bob", "alice", 0.75);
        mixer.remove_participant("bob");
        // re-adding bob must come back with defaults on both sides
        assert!(mixer.add_participant("bob"));
        assert_eq!(mixer.get_gain_entry("alice", "bob"), GainEntry::default());
        assert_eq!(mixer.get_gain_entry("bob", "alice"), GainEntry::default());
    }

    #[test]
    fn set_gain_is_idempotent() {
        let mixer = mixer_with(&["alice", "bob"]);
        mixer.set_gain("alice", "bob", 0.5);
        mixer.set_gain("alice", "bob", 0.5);
        assert_eq!(mixer.get_gain_entry("alice", "bob").gain, 0.5);
    }

    #[test]
    fn double_remove_is_safe() {
        let mixer = mixer_with(&["alice"]);
        mixer.remove_participant("alice");
        mixer.remove_participant("alice");
        assert_eq!(mixer.participant_count(), 0);
    }

    #[test]
    fn full_mixer_refuses_another() {
        let mixer = mixer_with(&["a", "b", "c", "d"]);
        assert!(!mixer.add_participant("e"));
        assert!(!mixer.add_participant("a"));
        assert_eq!(mixer.participant_count(), 4);
    }

    #[test]
    fn removed_participant_stays_out_of_the_mix() {
        let mixer = mixer_with(&["alice", "bob", "carol"]);
        let mut scratch = mixer.make_scratch();
        mixer.push_input("carol", &make_frame(7000, 1));
        mixer.remove_participant("carol");
        mixer.mix_cycle(&mut scratch);

        // carol's queued frame went with her
        let mut out = AudioFrame::new();
        assert!(!mixer.pop_output("alice", &mut out));
        assert!(!mixer.pop_output("carol", &mut out));
    }
}
