//! contracts between the room engine and the concrete transport stacks
//!
//! The engine never touches QUIC streams or data channels directly.  A
//! transport stack accepts a connection, wraps it in something that
//! implements [`TransportSession`], and feeds events into a
//! [`TransportCallbacks`] (in practice the session binder).  Sessions are
//! shared as `Arc<dyn TransportSession>` because their lifetime crosses
//! thread boundaries: the binder holds one while pending, the room holds
//! one once bound, and the transport keeps its own until close.
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// A single connected participant, as seen by the engine.
///
/// `send_datagram` must be safe to call from the RT mixer thread: best
/// effort, non blocking, failure tolerated.  `send_reliable` may block
/// briefly and is only called from non-RT threads.
#[cfg_attr(test, automock)]
pub trait TransportSession: Send + Sync {
    /// Fire one unreliable audio datagram at the peer.  Returns false if
    /// the transport dropped it (would block, congested, closed).
    fn send_datagram(&self, data: &[u8]) -> bool;

    /// Send a control message on the ordered reliable channel.
    fn send_reliable(&self, message: &str) -> bool;

    /// Tear the session down.
    fn close(&self);

    /// Opaque session identifier, unique per connection.
    fn id(&self) -> String;

    /// Remote address, used for rate limiting and logs.
    fn remote_address(&self) -> String;

    fn is_connected(&self) -> bool;
}

/// Delivery points a transport stack drives.
///
/// Stacks must guarantee `on_session_open` happens-before any other
/// callback for a session, that no callback runs concurrently with
/// `on_session_close` for the same session, and that close fires exactly
/// once.
pub trait TransportCallbacks: Send + Sync {
    /// A new connection finished its transport handshake.
    fn on_session_open(&self, session: Arc<dyn TransportSession>);

    /// A reliable channel message arrived.
    fn on_message(&self, session: &dyn TransportSession, message: &str);

    /// An unreliable datagram arrived.
    fn on_datagram(&self, session: &dyn TransportSession, data: &[u8]);

    /// The peer went away (or we closed it).
    fn on_session_close(&self, session: &dyn TransportSession);
}
