//! Application callbacks invoked by the hive.
//!
//! One trait method per event. Callbacks receive the hive itself so they can
//! arm further operations (`recv`, `send`, `accept`, ...) on any entity; the
//! handler's own entity stays owned by the hive throughout.

use crate::runtime::{AcceptError, AcceptorId, ConnectionError, ConnectionId, Hive};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;

/// Outcome of one completed `send`.
#[derive(Debug, Clone)]
pub struct SendCompletion {
    /// The bytes handed to `send`.
    pub data: Bytes,
    /// How many of them reached the socket.
    pub written: usize,
}

impl SendCompletion {
    pub fn requested(&self) -> usize {
        self.data.len()
    }

    /// Fewer bytes were written than requested.
    pub fn is_short(&self) -> bool {
        self.written < self.data.len()
    }

    /// The prefix that was actually written.
    pub fn written_bytes(&self) -> &[u8] {
        &self.data[..self.written.min(self.data.len())]
    }
}

/// Per-connection event callbacks.
pub trait ConnectionHandler {
    /// Inbound connection accepted. The peer is known; canonical next step is
    /// arming a receive.
    fn on_accept(&mut self, hive: &mut Hive, conn: ConnectionId, peer: SocketAddr);

    /// Outbound dial completed.
    fn on_connect(&mut self, hive: &mut Hive, conn: ConnectionId, peer: SocketAddr);

    /// A send completed. Reported once per `send`, in submission order.
    fn on_send(&mut self, _hive: &mut Hive, _conn: ConnectionId, _completion: &SendCompletion) {}

    /// The armed receive completed. An empty buffer means the peer closed its
    /// side; the connection is then closing.
    ///
    /// The receive is no longer pending when this runs, so it may re-arm.
    fn on_recv(&mut self, hive: &mut Hive, conn: ConnectionId, buffer: &mut BytesMut);

    /// Periodic tick with the time elapsed since the previous one.
    fn on_timer(&mut self, _hive: &mut Hive, _conn: ConnectionId, _delta: Duration) {}

    /// An operation failed. The connection is closed once this returns.
    fn on_error(&mut self, _hive: &mut Hive, _conn: ConnectionId, _error: ConnectionError) {}
}

/// Listening socket callbacks.
pub trait AcceptorHandler {
    /// An offered Connection received an inbound connect.
    ///
    /// Runs before the Connection's own `on_accept`. Returning `false` closes
    /// the Connection without any further callbacks on it.
    fn on_accept(
        &mut self,
        hive: &mut Hive,
        acceptor: AcceptorId,
        conn: ConnectionId,
        peer: SocketAddr,
    ) -> bool;

    fn on_timer(&mut self, _hive: &mut Hive, _acceptor: AcceptorId, _delta: Duration) {}

    /// An accept attempt failed. Already accepted Connections are unaffected.
    fn on_error(&mut self, _hive: &mut Hive, _acceptor: AcceptorId, _error: AcceptError) {}
}
