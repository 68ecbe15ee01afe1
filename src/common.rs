//! These modules are shared between the room engine and the transport stacks.
pub mod audio_packet;
pub mod box_error;
pub mod config;
pub mod control_message;
pub mod transport;
