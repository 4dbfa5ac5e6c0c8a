//! Connection state machine.
//!
//! Each connection tracks its lifecycle state, the armed receive, the FIFO
//! queue of outstanding sends, and the readiness last reported by the
//! reactor. Syscalls happen in the hive; this type only enforces which
//! operations are legal in which state.

use crate::runtime::handler::ConnectionHandler;
use crate::runtime::timer::Ticker;
use crate::runtime::HiveError;
use bytes::Bytes;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created by the application, not yet offered or dialed.
    Unconnected,
    /// Offered to an Acceptor, waiting for an inbound connect.
    Offered,
    /// Outbound dial in progress.
    Connecting,
    Open,
    /// No new operations; queued sends still drain.
    Closing,
    Closed,
}

/// A send waiting for the socket to accept its bytes.
#[derive(Debug)]
pub struct PendingSend {
    pub data: Bytes,
    pub written: usize,
}

impl PendingSend {
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.data.len()
    }
}

/// A single connection owned by the hive.
pub struct Connection {
    pub state: ConnState,
    pub stream: Option<TcpStream>,
    pub peer: Option<SocketAddr>,
    /// A receive is armed and has not completed yet.
    pub recv_pending: bool,
    /// Readiness cached from the reactor, cleared on `WouldBlock`.
    pub readable: bool,
    pub writable: bool,
    /// Already in the hive's ready queue.
    pub queued: bool,
    pub sends: VecDeque<PendingSend>,
    pub ticker: Option<Ticker>,
    /// Taken out while one of its callbacks runs.
    pub handler: Option<Box<dyn ConnectionHandler>>,
}

impl Connection {
    /// Create a new connection in the unconnected state.
    pub fn new(handler: Box<dyn ConnectionHandler>) -> Self {
        Self {
            state: ConnState::Unconnected,
            stream: None,
            peer: None,
            recv_pending: false,
            readable: false,
            writable: false,
            queued: false,
            sends: VecDeque::new(),
            ticker: None,
            handler: Some(handler),
        }
    }

    /// Reserve the connection as the target of an acceptor's next accept.
    pub fn offer(&mut self) -> Result<(), HiveError> {
        match self.state {
            ConnState::Unconnected => {
                self.state = ConnState::Offered;
                Ok(())
            }
            _ => Err(HiveError::NotUnconnected),
        }
    }

    /// Attach a socket whose outbound connect is in progress.
    pub fn start_connecting(&mut self, stream: TcpStream) -> Result<(), HiveError> {
        if self.state != ConnState::Unconnected {
            return Err(HiveError::NotUnconnected);
        }
        self.stream = Some(stream);
        self.state = ConnState::Connecting;
        Ok(())
    }

    /// Transition to open once the peer is known.
    ///
    /// Both directions are assumed ready until the socket says otherwise.
    pub fn open(&mut self, peer: SocketAddr, ticker: Option<Ticker>) {
        self.state = ConnState::Open;
        self.peer = Some(peer);
        self.readable = true;
        self.writable = true;
        self.ticker = ticker;
    }

    /// Arm exactly one receive.
    pub fn arm_recv(&mut self) -> Result<(), HiveError> {
        if self.state != ConnState::Open {
            return Err(HiveError::NotOpen);
        }
        if self.recv_pending {
            return Err(HiveError::ReceivePending);
        }
        self.recv_pending = true;
        Ok(())
    }

    /// Queue a send behind any earlier ones.
    pub fn queue_send(&mut self, data: Bytes) -> Result<(), HiveError> {
        if self.state != ConnState::Open {
            return Err(HiveError::NotOpen);
        }
        self.sends.push_back(PendingSend { data, written: 0 });
        Ok(())
    }

    /// Stop accepting new operations and let queued sends drain.
    pub fn close(&mut self) {
        match self.state {
            ConnState::Open => {
                self.state = ConnState::Closing;
                self.recv_pending = false;
                self.ticker = None;
            }
            ConnState::Closing | ConnState::Closed => {}
            _ => self.state = ConnState::Closed,
        }
    }

    /// Terminal failure: drop outstanding work.
    pub fn fail(&mut self) {
        self.state = ConnState::Closed;
        self.recv_pending = false;
        self.sends.clear();
    }

    /// Nothing further can happen on this connection.
    pub fn is_finished(&self) -> bool {
        match self.state {
            ConnState::Closed => true,
            ConnState::Closing => self.sends.is_empty(),
            _ => false,
        }
    }
}
