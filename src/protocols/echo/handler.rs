//! Echo handlers for the hive runtime.

use crate::console::Console;
use crate::runtime::{
    AcceptError, AcceptorHandler, AcceptorId, Address, ConnectionError, ConnectionHandler,
    ConnectionId, Hive, ListenError, SendCompletion,
};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bind `address`, then offer the first echo connection.
///
/// Returns the bound local address.
pub fn serve(
    hive: &mut Hive,
    address: &Address,
    console: Arc<Console>,
    continuous: bool,
) -> Result<SocketAddr, ListenError> {
    let acceptor = hive.acceptor(Box::new(EchoAcceptor::new(Arc::clone(&console), continuous)))?;
    let local = hive.listen(acceptor, address)?;
    let conn = hive.connection(Box::new(EchoConnection::new(console)))?;
    hive.accept(acceptor, conn)?;
    Ok(local)
}

/// Sends every received chunk straight back to the peer.
pub struct EchoConnection {
    console: Arc<Console>,
}

impl EchoConnection {
    pub fn new(console: Arc<Console>) -> Self {
        Self { console }
    }

    fn arm(&self, hive: &mut Hive, conn: ConnectionId) {
        if let Err(e) = hive.recv(conn) {
            warn!(conn = %conn, error = %e, "Failed to arm receive");
        }
    }
}

impl ConnectionHandler for EchoConnection {
    fn on_accept(&mut self, hive: &mut Hive, conn: ConnectionId, peer: SocketAddr) {
        self.console.accept(peer);
        self.arm(hive, conn);
    }

    fn on_connect(&mut self, hive: &mut Hive, conn: ConnectionId, peer: SocketAddr) {
        self.console.connect(peer);
        self.arm(hive, conn);
    }

    fn on_send(&mut self, _hive: &mut Hive, conn: ConnectionId, completion: &SendCompletion) {
        self.console.send(completion.written_bytes());
        if completion.is_short() {
            warn!(
                conn = %conn,
                written = completion.written,
                requested = completion.requested(),
                "Short echo"
            );
        }
    }

    fn on_recv(&mut self, hive: &mut Hive, conn: ConnectionId, buffer: &mut BytesMut) {
        self.console.recv(buffer);
        if buffer.is_empty() {
            debug!(conn = %conn, "Peer finished sending");
            return;
        }

        // Next read goes in before the echo
        self.arm(hive, conn);
        if let Err(e) = hive.send(conn, buffer.split().freeze()) {
            warn!(conn = %conn, error = %e, "Failed to queue echo");
        }
    }

    fn on_timer(&mut self, _hive: &mut Hive, _conn: ConnectionId, delta: Duration) {
        self.console.timer(delta);
    }

    fn on_error(&mut self, _hive: &mut Hive, _conn: ConnectionId, error: ConnectionError) {
        self.console.error(&error);
    }
}

/// Accepts inbound connections; keeps a fresh one offered when `continuous`.
pub struct EchoAcceptor {
    console: Arc<Console>,
    continuous: bool,
}

impl EchoAcceptor {
    pub fn new(console: Arc<Console>, continuous: bool) -> Self {
        Self {
            console,
            continuous,
        }
    }
}

impl AcceptorHandler for EchoAcceptor {
    fn on_accept(
        &mut self,
        hive: &mut Hive,
        acceptor: AcceptorId,
        conn: ConnectionId,
        peer: SocketAddr,
    ) -> bool {
        debug!(acceptor = %acceptor, conn = %conn, peer = %peer, "Echo client arrived");
        if self.continuous {
            match hive.connection(Box::new(EchoConnection::new(Arc::clone(&self.console)))) {
                Ok(next) => {
                    if let Err(e) = hive.accept(acceptor, next) {
                        warn!(acceptor = %acceptor, error = %e, "Failed to offer next connection");
                        let _ = hive.close(next);
                    }
                }
                Err(e) => {
                    warn!(acceptor = %acceptor, error = %e, "No connection left to offer");
                }
            }
        }
        true
    }

    fn on_timer(&mut self, _hive: &mut Hive, _acceptor: AcceptorId, delta: Duration) {
        self.console.timer(delta);
    }

    fn on_error(&mut self, _hive: &mut Hive, _acceptor: AcceptorId, error: AcceptError) {
        self.console.error(&error);
    }
}
