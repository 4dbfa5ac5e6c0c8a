//! Helpers for driving a hive over loopback in tests.

use crate::runtime::{
    AcceptError, AcceptorHandler, AcceptorId, Address, ConnectionError, ConnectionHandler,
    ConnectionId, Hive, HiveConfig, SendCompletion,
};
use bytes::BytesMut;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

/// Hive config with timers disabled so event logs stay deterministic.
pub fn quiet_config() -> HiveConfig {
    HiveConfig {
        timer_interval: Duration::ZERO,
        ..HiveConfig::default()
    }
}

/// An ephemeral loopback port.
pub fn loopback() -> Address {
    Address::new("127.0.0.1", 0)
}

/// Poll until `done` holds, failing the test after a few seconds.
pub fn poll_until(hive: &mut Hive, mut done: impl FnMut(&Hive) -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done(hive) {
        assert!(Instant::now() < deadline, "timed out waiting on hive");
        hive.poll_timeout(Some(Duration::from_millis(10))).unwrap();
    }
}

/// Poll for a fixed duration.
pub fn poll_for(hive: &mut Hive, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        hive.poll_timeout(Some(Duration::from_millis(5))).unwrap();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Gate(ConnectionId, SocketAddr),
    AcceptorTimer(Duration),
    AcceptorError(AcceptError),
    Accept(ConnectionId, SocketAddr),
    Connect(ConnectionId, SocketAddr),
    Recv(ConnectionId, Vec<u8>),
    Send(ConnectionId, Vec<u8>, usize),
    Timer(ConnectionId, Duration),
    Error(ConnectionId, ConnectionError),
}

pub type Log = Rc<RefCell<Vec<Event>>>;

pub fn count(log: &Log, pred: impl Fn(&Event) -> bool) -> usize {
    log.borrow().iter().filter(|e| pred(e)).count()
}

/// Records every connection event; optionally keeps one receive armed.
pub struct Recorder {
    pub log: Log,
    pub rearm: bool,
}

impl Recorder {
    pub fn new(log: &Log, rearm: bool) -> Box<Self> {
        Box::new(Self {
            log: Rc::clone(log),
            rearm,
        })
    }
}

impl ConnectionHandler for Recorder {
    fn on_accept(&mut self, hive: &mut Hive, conn: ConnectionId, peer: SocketAddr) {
        self.log.borrow_mut().push(Event::Accept(conn, peer));
        hive.recv(conn).unwrap();
    }

    fn on_connect(&mut self, hive: &mut Hive, conn: ConnectionId, peer: SocketAddr) {
        self.log.borrow_mut().push(Event::Connect(conn, peer));
        hive.recv(conn).unwrap();
    }

    fn on_send(&mut self, _hive: &mut Hive, conn: ConnectionId, completion: &SendCompletion) {
        self.log.borrow_mut().push(Event::Send(
            conn,
            completion.data.to_vec(),
            completion.written,
        ));
    }

    fn on_recv(&mut self, hive: &mut Hive, conn: ConnectionId, buffer: &mut BytesMut) {
        self.log.borrow_mut().push(Event::Recv(conn, buffer.to_vec()));
        if self.rearm && !buffer.is_empty() {
            hive.recv(conn).unwrap();
        }
    }

    fn on_timer(&mut self, _hive: &mut Hive, conn: ConnectionId, delta: Duration) {
        self.log.borrow_mut().push(Event::Timer(conn, delta));
    }

    fn on_error(&mut self, _hive: &mut Hive, conn: ConnectionId, error: ConnectionError) {
        self.log.borrow_mut().push(Event::Error(conn, error));
    }
}

/// Records acceptor events and answers the accept gate with `allow`.
pub struct Gate {
    pub log: Log,
    pub allow: bool,
}

impl Gate {
    pub fn new(log: &Log, allow: bool) -> Box<Self> {
        Box::new(Self {
            log: Rc::clone(log),
            allow,
        })
    }
}

impl AcceptorHandler for Gate {
    fn on_accept(
        &mut self,
        _hive: &mut Hive,
        _acceptor: AcceptorId,
        conn: ConnectionId,
        peer: SocketAddr,
    ) -> bool {
        self.log.borrow_mut().push(Event::Gate(conn, peer));
        self.allow
    }

    fn on_timer(&mut self, _hive: &mut Hive, _acceptor: AcceptorId, delta: Duration) {
        self.log.borrow_mut().push(Event::AcceptorTimer(delta));
    }

    fn on_error(&mut self, _hive: &mut Hive, _acceptor: AcceptorId, error: AcceptError) {
        self.log.borrow_mut().push(Event::AcceptorError(error));
    }
}
