//! ensemble - rehearsal room server library
//!
//! provides the per-room mixing engine and transport plumbing for a
//! low latency group rehearsal server.  Musicians meet in named rooms and
//! trade uncompressed mono PCM; every participant gets their own mix of
//! everybody else.  Concrete transports (WebTransport, data channels) and
//! the HTTP lobby live outside this crate and talk to it through the
//! contracts in [`common::transport`].
extern crate json;

pub mod common;
pub mod server;
pub mod sound;
pub mod utils;
