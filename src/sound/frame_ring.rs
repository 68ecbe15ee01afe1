//! wait-free single-producer single-consumer queue of audio frames
//!
//! This is the workhorse between the network threads and the mixer.  One
//! ring carries frames from the receive path into the mixer, another
//! carries mixed frames back out to the send path.  Nothing on either
//! side ever blocks: a push into a full ring drops the frame, a pop from
//! an empty ring reports nothing there.  That is the whole backpressure
//! story for the audio path.
//!
//! Exactly one thread may push and exactly one thread may pop.  Both ends
//! are reached through a shared handle, so the slot storage sits in an
//! `UnsafeCell` and the head/tail indices carry the synchronization:
//! the producer publishes a slot with a release store of `tail`, and a
//! consumer that acquires `tail` therefore sees the slot's bytes.
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::audio_packet::AudioFrame;

pub const DEFAULT_RING_CAPACITY: usize = 64;

pub struct FrameRing {
    slots: UnsafeCell<Box<[AudioFrame]>>,
    /// next slot to pop.  Written only by the consumer.
    head: AtomicUsize,
    /// next slot to fill.  Written only by the producer.
    tail: AtomicUsize,
}

// One producer thread and one consumer thread, each confined to its own
// index and the slots that index hands over.  See push/pop for the
// ordering that makes the handover sound.
unsafe impl Sync for FrameRing {}
unsafe impl Send for FrameRing {}

impl FrameRing {
    /// Ring that can hold `capacity` frames.  Anything below 8 is bumped
    /// up; latency-sensitive callers run small, but a degenerate ring
    /// just turns the audio path into a packet shredder.
    pub fn new(capacity: usize) -> FrameRing {
        let cap = capacity.max(8);
        // one slot is kept empty to tell full from empty
        let slots = vec![AudioFrame::new(); cap + 1].into_boxed_slice();
        FrameRing {
            slots: UnsafeCell::new(slots),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn slot_count(&self) -> usize {
        // slots never reallocates, so the raw len is stable
        unsafe { (&*self.slots.get()).len() }
    }

    /// Producer side.  Returns false (frame dropped) when full.
    pub fn try_push(&self, frame: &AudioFrame) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.slot_count();
        if next == self.head.load(Ordering::Acquire) {
            return false; // full
        }
        unsafe {
            (*self.slots.get())[tail] = *frame;
        }
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Consumer side.  Returns false when empty.
    pub fn try_pop(&self, out: &mut AudioFrame) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return false; // empty
        }
        unsafe {
            *out = (*self.slots.get())[head];
        }
        self.head.store((head + 1) % self.slot_count(), Ordering::Release);
        true
    }

    /// Approximate depth, for diagnostics only.  May lag either end.
    pub fn size_hint(&self) -> usize {
        let n = self.slot_count();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        (tail + n - head) % n
    }
}
