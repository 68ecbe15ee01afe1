//! The room server proper: rooms, their manager, session binding,
//! latency telemetry, and the engine that wires it all together.
pub mod engine;
pub mod latency_tracker;
pub mod room;
pub mod room_manager;
pub mod room_names;
pub mod session_binder;
