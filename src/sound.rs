//! The audio engine: frame queues and the per-room mixer.
pub mod frame_ring;
pub mod mixer;
