//! The hive event loop.
//!
//! Readiness-based model: mio tells us when sockets are ready, then we
//! perform non-blocking syscalls on behalf of the operations the application
//! armed. Readiness is cached per entity (mio is edge-triggered) and only
//! cleared when a syscall reports `WouldBlock`.
//!
//! Each `poll` is one bounded pass: it waits for readiness (at most the
//! given timeout or until the next timer deadline), drains the ready queue as
//! it stood at that moment, then fires due timers. Work armed by callbacks
//! during the pass is queued for the next `poll`.

use crate::runtime::acceptor::{Acceptor, AcceptorState};
use crate::runtime::connection::{ConnState, Connection, PendingSend};
use crate::runtime::handler::{AcceptorHandler, ConnectionHandler, SendCompletion};
use crate::runtime::timer::Ticker;
use crate::runtime::token::{Registry, Source, WAKER_TOKEN};
use crate::runtime::{
    AcceptError, AcceptorId, Address, ConnectionError, ConnectionId, HiveError, ListenError,
};
use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Tunables for a hive.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Maximum bytes delivered by one receive.
    pub buffer_size: usize,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// Maximum number of live Connections.
    pub max_connections: usize,
    /// Period of `on_timer` callbacks. Zero disables them.
    pub timer_interval: Duration,
    pub listen_backlog: i32,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            events_capacity: 1024,
            max_connections: 1024,
            timer_interval: Duration::from_secs(1),
            listen_backlog: 1024,
        }
    }
}

/// Requests a stop from any thread.
///
/// The hive observes the request at its next `poll`, which is woken up
/// immediately if it is currently waiting.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    #[allow(dead_code)]
    pub fn stop(&self) {
        self.requested.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake hive");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Ready {
    Acceptor(AcceptorId),
    Connection(ConnectionId),
}

enum ReadOutcome {
    Data(BytesMut),
    Retry,
    Failed(io::Error),
}

/// Owns the reactor and every Acceptor and Connection registered with it.
pub struct Hive {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
    stopped: bool,
    acceptors: Registry<Acceptor>,
    connections: Registry<Connection>,
    ready: VecDeque<Ready>,
    config: HiveConfig,
}

impl Hive {
    pub fn new(config: HiveConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        debug!(
            buffer_size = config.buffer_size,
            events_capacity = config.events_capacity,
            max_connections = config.max_connections,
            timer_interval = ?config.timer_interval,
            "Hive created"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            waker,
            stop_requested: Arc::new(AtomicBool::new(false)),
            stopped: false,
            acceptors: Registry::new(usize::MAX),
            connections: Registry::new(config.max_connections),
            ready: VecDeque::new(),
            config,
        })
    }

    #[allow(dead_code)]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: Arc::clone(&self.stop_requested),
            waker: Arc::clone(&self.waker),
        }
    }

    #[allow(dead_code)]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // ---------------------------------------------------------------------
    // Acceptors
    // ---------------------------------------------------------------------

    /// Create an idle Acceptor.
    pub fn acceptor(&mut self, handler: Box<dyn AcceptorHandler>) -> Result<AcceptorId, HiveError> {
        self.ensure_running()?;
        self.acceptors
            .insert(Acceptor::new(handler))
            .map(AcceptorId)
            .ok_or(HiveError::CapacityExhausted {
                capacity: usize::MAX,
            })
    }

    /// Bind and start listening. Returns the bound local address.
    pub fn listen(&mut self, id: AcceptorId, address: &Address) -> Result<SocketAddr, ListenError> {
        self.ensure_running()?;
        match self.acceptors.get(id.0).map(|a| a.state) {
            None => return Err(HiveError::UnknownAcceptor.into()),
            Some(AcceptorState::Idle) => {}
            Some(AcceptorState::Closed) => return Err(HiveError::NotListening.into()),
            Some(_) => return Err(HiveError::AlreadyListening.into()),
        }

        let addr = address.resolve()?;
        let bind_error = |source| ListenError::Bind { addr, source };
        let std_listener = create_listener(addr, self.config.listen_backlog).map_err(bind_error)?;
        let local = std_listener.local_addr().map_err(bind_error)?;

        let mut listener = TcpListener::from_std(std_listener);
        self.poll
            .registry()
            .register(
                &mut listener,
                Source::Acceptor(id.0.index()).token(),
                Interest::READABLE,
            )
            .map_err(ListenError::Register)?;

        let ticker = Ticker::start(self.config.timer_interval, Instant::now());
        let Some(acceptor) = self.acceptors.get_mut(id.0) else {
            return Err(HiveError::UnknownAcceptor.into());
        };
        acceptor.listen(listener, local, ticker);
        enqueue(&mut self.ready, &mut acceptor.queued, Ready::Acceptor(id));

        info!(acceptor = %id, addr = %local, "Listening");
        Ok(local)
    }

    /// Offer an unconnected Connection as the target of the next accept.
    pub fn accept(&mut self, id: AcceptorId, conn: ConnectionId) -> Result<(), HiveError> {
        self.ensure_running()?;
        let acceptor = self
            .acceptors
            .get_mut(id.0)
            .ok_or(HiveError::UnknownAcceptor)?;
        let connection = self
            .connections
            .get_mut(conn.0)
            .ok_or(HiveError::UnknownConnection)?;

        if connection.state != ConnState::Unconnected {
            return Err(HiveError::NotUnconnected);
        }
        acceptor.offer(conn)?;
        connection.offer()?;
        enqueue(&mut self.ready, &mut acceptor.queued, Ready::Acceptor(id));

        trace!(acceptor = %id, conn = %conn, "Connection offered");
        Ok(())
    }

    /// The address an Acceptor is bound to.
    #[allow(dead_code)]
    pub fn local_addr(&self, id: AcceptorId) -> Option<SocketAddr> {
        self.acceptors.get(id.0).and_then(|a| a.local)
    }

    /// Stop listening and release the Acceptor.
    ///
    /// A Connection still offered to it is released as well.
    #[allow(dead_code)]
    pub fn close_acceptor(&mut self, id: AcceptorId) -> Result<(), HiveError> {
        let mut acceptor = self
            .acceptors
            .remove(id.0)
            .ok_or(HiveError::UnknownAcceptor)?;
        if let Some(mut listener) = acceptor.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        if let Some(offer) = acceptor.close() {
            self.release_connection(offer);
        }

        debug!(acceptor = %id, "Acceptor closed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------------

    /// Create an unconnected Connection.
    pub fn connection(
        &mut self,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectionId, HiveError> {
        self.ensure_running()?;
        self.connections
            .insert(Connection::new(handler))
            .map(ConnectionId)
            .ok_or(HiveError::CapacityExhausted {
                capacity: self.config.max_connections,
            })
    }

    /// Dial out. `on_connect` or `on_error` fires once the attempt resolves.
    #[allow(dead_code)]
    pub fn connect(&mut self, id: ConnectionId, address: &Address) -> Result<(), HiveError> {
        self.ensure_running()?;
        let connection = self
            .connections
            .get_mut(id.0)
            .ok_or(HiveError::UnknownConnection)?;
        if connection.state != ConnState::Unconnected {
            return Err(HiveError::NotUnconnected);
        }

        let addr = address
            .resolve()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut stream = TcpStream::connect(addr)?;
        self.poll.registry().register(
            &mut stream,
            Source::Connection(id.0.index()).token(),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        connection.start_connecting(stream)?;

        debug!(conn = %id, addr = %addr, "Connecting");
        Ok(())
    }

    /// Arm exactly one receive.
    ///
    /// Fails with `ReceivePending` if one is already armed; the armed receive
    /// is left untouched.
    pub fn recv(&mut self, id: ConnectionId) -> Result<(), HiveError> {
        self.ensure_running()?;
        let connection = self
            .connections
            .get_mut(id.0)
            .ok_or(HiveError::UnknownConnection)?;
        connection.arm_recv()?;
        enqueue(&mut self.ready, &mut connection.queued, Ready::Connection(id));
        Ok(())
    }

    /// Queue bytes for sending. Sends complete in submission order.
    pub fn send(&mut self, id: ConnectionId, data: impl Into<Bytes>) -> Result<(), HiveError> {
        self.ensure_running()?;
        let connection = self
            .connections
            .get_mut(id.0)
            .ok_or(HiveError::UnknownConnection)?;
        connection.queue_send(data.into())?;
        enqueue(&mut self.ready, &mut connection.queued, Ready::Connection(id));
        Ok(())
    }

    /// Close after queued sends drain.
    pub fn close(&mut self, id: ConnectionId) -> Result<(), HiveError> {
        self.ensure_running()?;
        let connection = self
            .connections
            .get_mut(id.0)
            .ok_or(HiveError::UnknownConnection)?;
        let offered = connection.state == ConnState::Offered;
        connection.close();
        enqueue(&mut self.ready, &mut connection.queued, Ready::Connection(id));
        if offered {
            self.withdraw_offer(id);
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(id.0).and_then(|c| c.peer)
    }

    /// `None` once the Connection has been released.
    #[allow(dead_code)]
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnState> {
        self.connections.get(id.0).map(|c| c.state)
    }

    #[allow(dead_code)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Dispatch whatever is ready right now without waiting.
    #[allow(dead_code)]
    pub fn poll(&mut self) -> io::Result<usize> {
        self.poll_timeout(Some(Duration::ZERO))
    }

    /// Wait up to `timeout` (or the next timer deadline) for readiness, then
    /// dispatch one pass. Returns the number of callbacks invoked.
    ///
    /// Errors only for loop-wide failures of the underlying reactor.
    pub fn poll_timeout(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if self.check_stop() {
            return Ok(0);
        }

        let now = Instant::now();
        let wait = if self.ready.is_empty() {
            match (timeout, self.next_deadline()) {
                (timeout, None) => timeout,
                (None, Some(deadline)) => Some(deadline.saturating_duration_since(now)),
                (Some(timeout), Some(deadline)) => {
                    Some(timeout.min(deadline.saturating_duration_since(now)))
                }
            }
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = self.poll.poll(&mut self.events, wait) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }
        self.collect_events();

        if self.check_stop() {
            return Ok(0);
        }

        let batch: Vec<Ready> = self.ready.drain(..).collect();
        let mut dispatched = 0;
        for ready in batch {
            if self.stopped {
                return Ok(dispatched);
            }
            dispatched += match ready {
                Ready::Acceptor(id) => self.drive_acceptor(id),
                Ready::Connection(id) => self.drive_connection(id),
            };
        }

        if !self.stopped {
            dispatched += self.fire_timers(Instant::now());
        }
        Ok(dispatched)
    }

    /// Tear down every Acceptor and Connection. In-flight operations are
    /// abandoned. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop_requested.store(true, Ordering::Release);

        for mut acceptor in self.acceptors.drain() {
            if let Some(mut listener) = acceptor.listener.take() {
                let _ = self.poll.registry().deregister(&mut listener);
            }
        }
        let abandoned = self.connections.len();
        for mut connection in self.connections.drain() {
            if let Some(mut stream) = connection.stream.take() {
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }
        self.ready.clear();

        info!(abandoned, "Hive stopped");
    }

    fn ensure_running(&self) -> Result<(), HiveError> {
        if self.stopped {
            Err(HiveError::Stopped)
        } else {
            Ok(())
        }
    }

    fn check_stop(&mut self) -> bool {
        if !self.stopped && self.stop_requested.load(Ordering::Acquire) {
            self.stop();
        }
        self.stopped
    }

    /// Fold readiness events into the cached flags and queue the entities.
    fn collect_events(&mut self) {
        for event in self.events.iter() {
            match Source::from_token(event.token()) {
                Source::Waker => {}
                Source::Acceptor(index) => {
                    let Some(handle) = self.acceptors.handle_at(index) else {
                        continue;
                    };
                    if let Some(acceptor) = self.acceptors.get_mut(handle) {
                        acceptor.readable = true;
                        enqueue(
                            &mut self.ready,
                            &mut acceptor.queued,
                            Ready::Acceptor(AcceptorId(handle)),
                        );
                    }
                }
                Source::Connection(index) => {
                    let Some(handle) = self.connections.handle_at(index) else {
                        continue;
                    };
                    if let Some(connection) = self.connections.get_mut(handle) {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            connection.readable = true;
                        }
                        if event.is_writable() || event.is_write_closed() || event.is_error() {
                            connection.writable = true;
                        }
                        enqueue(
                            &mut self.ready,
                            &mut connection.queued,
                            Ready::Connection(ConnectionId(handle)),
                        );
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let acceptors = self.acceptors.iter().filter_map(|(_, a)| a.ticker);
        let connections = self.connections.iter().filter_map(|(_, c)| c.ticker);
        acceptors.chain(connections).map(|t| t.deadline()).min()
    }

    fn fire_timers(&mut self, now: Instant) -> usize {
        let mut acceptor_ticks = Vec::new();
        for (handle, acceptor) in self.acceptors.iter_mut() {
            if let Some(delta) = acceptor.ticker.as_mut().and_then(|t| t.poll(now)) {
                acceptor_ticks.push((AcceptorId(handle), delta));
            }
        }
        let mut connection_ticks = Vec::new();
        for (handle, connection) in self.connections.iter_mut() {
            if connection.state != ConnState::Open {
                continue;
            }
            if let Some(delta) = connection.ticker.as_mut().and_then(|t| t.poll(now)) {
                connection_ticks.push((ConnectionId(handle), delta));
            }
        }

        let mut dispatched = 0;
        for (id, delta) in acceptor_ticks {
            if self
                .with_acceptor_handler(id, |handler, hive| handler.on_timer(hive, id, delta))
                .is_some()
            {
                dispatched += 1;
            }
        }
        for (id, delta) in connection_ticks {
            if self
                .with_connection_handler(id, |handler, hive| handler.on_timer(hive, id, delta))
                .is_some()
            {
                dispatched += 1;
            }
        }
        dispatched
    }

    // ---------------------------------------------------------------------
    // Acceptor dispatch
    // ---------------------------------------------------------------------

    fn drive_acceptor(&mut self, id: AcceptorId) -> usize {
        let Some(acceptor) = self.acceptors.get_mut(id.0) else {
            return 0;
        };
        acceptor.queued = false;
        if !acceptor.can_accept() {
            return 0;
        }

        // The offered Connection may have been closed since it was offered
        let offer = acceptor.pending_offer();
        let offer_live = offer
            .and_then(|conn| self.connections.get(conn.0))
            .is_some_and(|c| c.state == ConnState::Offered);
        if !offer_live {
            acceptor.take_offer();
            debug!(acceptor = %id, "Dropped stale offer");
            return 0;
        }

        let Some(listener) = acceptor.listener.as_ref() else {
            return 0;
        };
        match listener.accept() {
            Ok((stream, peer)) => self.complete_accept(id, stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                acceptor.readable = false;
                0
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                enqueue(&mut self.ready, &mut acceptor.queued, Ready::Acceptor(id));
                0
            }
            Err(e) => {
                warn!(acceptor = %id, error = %e, "Accept error");
                let error = AcceptError::from(&e);
                self.with_acceptor_handler(id, |handler, hive| handler.on_error(hive, id, error))
                    .map_or(0, |_| 1)
            }
        }
    }

    fn complete_accept(&mut self, id: AcceptorId, mut stream: TcpStream, peer: SocketAddr) -> usize {
        let Some(conn) = self.acceptors.get_mut(id.0).and_then(|a| a.take_offer()) else {
            return 0;
        };
        debug!(acceptor = %id, conn = %conn, peer = %peer, "Accepted connection");

        // More connections may be waiting in the backlog once re-offered
        let keep = self
            .with_acceptor_handler(id, |handler, hive| handler.on_accept(hive, id, conn, peer))
            .unwrap_or(false);
        let mut dispatched = 1;

        let still_offered = self
            .connections
            .get(conn.0)
            .is_some_and(|c| c.state == ConnState::Offered);
        if !keep || !still_offered {
            debug!(conn = %conn, peer = %peer, "Connection rejected");
            self.release_connection(conn);
            return dispatched;
        }

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Source::Connection(conn.0.index()).token(),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.fail_connection(conn, &e);
            self.release_connection(conn);
            return dispatched + 1;
        }

        let ticker = Ticker::start(self.config.timer_interval, Instant::now());
        if let Some(connection) = self.connections.get_mut(conn.0) {
            connection.stream = Some(stream);
            connection.open(peer, ticker);
        }

        if self
            .with_connection_handler(conn, |handler, hive| handler.on_accept(hive, conn, peer))
            .is_some()
        {
            dispatched += 1;
        }
        self.reap_if_finished(conn);
        dispatched
    }

    // ---------------------------------------------------------------------
    // Connection dispatch
    // ---------------------------------------------------------------------

    fn drive_connection(&mut self, id: ConnectionId) -> usize {
        let Some(connection) = self.connections.get_mut(id.0) else {
            return 0;
        };
        connection.queued = false;

        let mut dispatched = 0;
        if connection.state == ConnState::Connecting {
            dispatched += self.finish_connect(id);
        }
        dispatched += self.drive_recv(id);
        dispatched += self.drive_sends(id);
        self.reap_if_finished(id);
        dispatched
    }

    fn finish_connect(&mut self, id: ConnectionId) -> usize {
        let outcome = {
            let Some(connection) = self.connections.get_mut(id.0) else {
                return 0;
            };
            if !connection.writable {
                return 0;
            }
            let Some(stream) = connection.stream.as_ref() else {
                return 0;
            };
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(peer) => Ok(peer),
                    Err(ref e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        // Spurious wakeup, the handshake is still running
                        connection.writable = false;
                        return 0;
                    }
                    Err(e) => Err(e),
                },
            }
        };

        match outcome {
            Ok(peer) => {
                let ticker = Ticker::start(self.config.timer_interval, Instant::now());
                if let Some(connection) = self.connections.get_mut(id.0) {
                    connection.open(peer, ticker);
                }
                debug!(conn = %id, peer = %peer, "Connected");
                self.with_connection_handler(id, |handler, hive| handler.on_connect(hive, id, peer))
                    .map_or(0, |_| 1)
            }
            Err(e) => {
                self.fail_connection(id, &e);
                1
            }
        }
    }

    fn drive_recv(&mut self, id: ConnectionId) -> usize {
        let buffer_size = self.config.buffer_size;
        let outcome = {
            let Some(connection) = self.connections.get_mut(id.0) else {
                return 0;
            };
            if connection.state != ConnState::Open
                || !connection.recv_pending
                || !connection.readable
            {
                return 0;
            }
            let Some(stream) = connection.stream.as_mut() else {
                return 0;
            };

            let mut buffer = BytesMut::zeroed(buffer_size);
            match stream.read(&mut buffer) {
                Ok(n) => {
                    buffer.truncate(n);
                    connection.recv_pending = false;
                    if n == 0 {
                        // EOF
                        connection.close();
                    }
                    ReadOutcome::Data(buffer)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    connection.readable = false;
                    return 0;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
                Err(e) => ReadOutcome::Failed(e),
            }
        };

        match outcome {
            ReadOutcome::Data(mut buffer) => {
                trace!(conn = %id, bytes = buffer.len(), "Receive completed");
                self.with_connection_handler(id, |handler, hive| {
                    handler.on_recv(hive, id, &mut buffer)
                })
                .map_or(0, |_| 1)
            }
            ReadOutcome::Retry => {
                if let Some(connection) = self.connections.get_mut(id.0) {
                    enqueue(&mut self.ready, &mut connection.queued, Ready::Connection(id));
                }
                0
            }
            ReadOutcome::Failed(e) => {
                self.fail_connection(id, &e);
                1
            }
        }
    }

    fn drive_sends(&mut self, id: ConnectionId) -> usize {
        let mut completed: Vec<PendingSend> = Vec::new();
        let mut failure = None;
        {
            let Some(connection) = self.connections.get_mut(id.0) else {
                return 0;
            };
            if !matches!(connection.state, ConnState::Open | ConnState::Closing)
                || !connection.writable
            {
                return 0;
            }
            let Some(stream) = connection.stream.as_mut() else {
                return 0;
            };

            loop {
                let Some(front) = connection.sends.front_mut() else {
                    break;
                };
                if front.is_complete() {
                    completed.extend(connection.sends.pop_front());
                    continue;
                }
                match stream.write(front.remaining()) {
                    Ok(0) => {
                        failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                        break;
                    }
                    Ok(n) => front.written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        connection.writable = false;
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            // A partially written send is still reported, as a short write
            if failure.is_some() {
                if let Some(partial) = connection.sends.pop_front() {
                    if partial.written > 0 {
                        completed.push(partial);
                    }
                }
            }
        }

        let mut dispatched = 0;
        for send in completed {
            let completion = SendCompletion {
                data: send.data,
                written: send.written,
            };
            if completion.is_short() {
                warn!(
                    conn = %id,
                    requested = completion.requested(),
                    written = completion.written,
                    "Short write"
                );
            } else {
                trace!(conn = %id, bytes = completion.written, "Send completed");
            }
            if self
                .with_connection_handler(id, |handler, hive| {
                    handler.on_send(hive, id, &completion)
                })
                .is_some()
            {
                dispatched += 1;
            }
        }

        if let Some(e) = failure {
            self.fail_connection(id, &e);
            dispatched += 1;
        }
        dispatched
    }

    /// Mark the Connection closed and report the failure to its handler.
    fn fail_connection(&mut self, id: ConnectionId, e: &io::Error) {
        let Some(connection) = self.connections.get_mut(id.0) else {
            return;
        };
        if connection.state == ConnState::Closed {
            return;
        }
        connection.fail();

        let error = ConnectionError::from(e);
        debug!(conn = %id, error = %e, kind = ?error, "Connection error");
        self.with_connection_handler(id, |handler, hive| handler.on_error(hive, id, error));
    }

    fn reap_if_finished(&mut self, id: ConnectionId) {
        if self
            .connections
            .get(id.0)
            .is_some_and(|c| c.is_finished())
        {
            self.release_connection(id);
        }
    }

    fn release_connection(&mut self, id: ConnectionId) {
        if let Some(mut connection) = self.connections.remove(id.0) {
            if let Some(mut stream) = connection.stream.take() {
                let _ = self.poll.registry().deregister(&mut stream);
            }
            self.withdraw_offer(id);
            debug!(conn = %id, peer = ?connection.peer, "Connection closed");
        }
    }

    /// Free any Acceptor still holding `conn` as its offer.
    fn withdraw_offer(&mut self, conn: ConnectionId) {
        for (handle, acceptor) in self.acceptors.iter_mut() {
            if acceptor.pending_offer() == Some(conn) {
                acceptor.take_offer();
                trace!(acceptor = %AcceptorId(handle), conn = %conn, "Offer withdrawn");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Callback plumbing
    // ---------------------------------------------------------------------

    /// Run a callback with the handler temporarily taken out of its entity,
    /// so the callback can borrow the hive mutably.
    ///
    /// Returns `None` if the entity is gone. If the entity is released while
    /// the callback runs, the handler is dropped afterwards.
    fn with_connection_handler<R>(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut dyn ConnectionHandler, &mut Hive) -> R,
    ) -> Option<R> {
        let mut handler = self.connections.get_mut(id.0)?.handler.take()?;
        let result = f(&mut *handler, self);
        if let Some(connection) = self.connections.get_mut(id.0) {
            connection.handler = Some(handler);
        }
        Some(result)
    }

    fn with_acceptor_handler<R>(
        &mut self,
        id: AcceptorId,
        f: impl FnOnce(&mut dyn AcceptorHandler, &mut Hive) -> R,
    ) -> Option<R> {
        let mut handler = self.acceptors.get_mut(id.0)?.handler.take()?;
        let result = f(&mut *handler, self);
        if let Some(acceptor) = self.acceptors.get_mut(id.0) {
            acceptor.handler = Some(handler);
        }
        Some(result)
    }
}

fn enqueue(ready: &mut VecDeque<Ready>, queued: &mut bool, item: Ready) {
    if !*queued {
        *queued = true;
        ready.push_back(item);
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{
        count, loopback, poll_for, poll_until, quiet_config, Event, Gate, Log, Recorder,
    };
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;

    fn serve(hive: &mut Hive, log: &Log, allow: bool, rearm: bool) -> (AcceptorId, ConnectionId, SocketAddr) {
        let acceptor = hive.acceptor(Gate::new(log, allow)).unwrap();
        let local = hive.listen(acceptor, &loopback()).unwrap();
        let conn = hive.connection(Recorder::new(log, rearm)).unwrap();
        hive.accept(acceptor, conn).unwrap();
        (acceptor, conn, local)
    }

    fn client(local: SocketAddr) -> StdStream {
        let stream = StdStream::connect(local).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn accepted(log: &Log) -> usize {
        count(log, |e| matches!(e, Event::Accept(..)))
    }

    fn received(log: &Log) -> Vec<Vec<u8>> {
        log.borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Recv(_, data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_accept_then_receive() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, false);

        let mut stream = client(local);
        let peer = stream.local_addr().unwrap();
        poll_until(&mut hive, |_| accepted(&log) == 1);

        stream.write_all(b"hello").unwrap();
        poll_until(&mut hive, |_| received(&log).len() == 1);

        // Acceptor gate fires before the connection's own accept
        assert_eq!(
            *log.borrow(),
            vec![
                Event::Gate(conn, peer),
                Event::Accept(conn, peer),
                Event::Recv(conn, b"hello".to_vec()),
            ]
        );
        assert_eq!(hive.peer_addr(conn), Some(peer));
        assert_eq!(hive.connection_state(conn), Some(ConnState::Open));
    }

    #[test]
    fn test_second_recv_while_pending_is_rejected() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, false);

        let mut stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);

        // The handler armed a receive in on_accept
        assert!(matches!(hive.recv(conn), Err(HiveError::ReceivePending)));

        stream.write_all(b"one").unwrap();
        poll_until(&mut hive, |_| received(&log).len() == 1);

        // Not re-armed, so nothing else is delivered
        stream.write_all(b"two").unwrap();
        poll_for(&mut hive, Duration::from_millis(50));
        assert_eq!(received(&log), vec![b"one".to_vec()]);

        hive.recv(conn).unwrap();
        poll_until(&mut hive, |_| received(&log).len() == 2);
        assert_eq!(received(&log)[1], b"two".to_vec());
    }

    #[test]
    fn test_sends_complete_in_submission_order() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, true);

        let mut stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);

        hive.send(conn, "first").unwrap();
        hive.send(conn, "second").unwrap();
        poll_until(&mut hive, |_| count(&log, |e| matches!(e, Event::Send(..))) == 2);

        let sends: Vec<_> = log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Send(_, data, written) => Some((data.clone(), *written)),
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec![(b"first".to_vec(), 5), (b"second".to_vec(), 6)]);

        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"firstsecond");
    }

    #[test]
    fn test_rejected_connection_gets_no_callbacks() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, false, true);

        let mut stream = client(local);
        poll_until(&mut hive, |_| count(&log, |e| matches!(e, Event::Gate(..))) == 1);

        let mut buf = [0u8; 8];
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes from rejected connection"),
        }

        poll_for(&mut hive, Duration::from_millis(30));
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(hive.connection_count(), 0);
        assert!(matches!(hive.recv(conn), Err(HiveError::UnknownConnection)));
    }

    #[test]
    fn test_peer_reset_reports_error() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, true);

        let stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);

        // SO_LINGER=0 turns close into a reset
        let socket = socket2::Socket::from(stream);
        socket.set_linger(Some(Duration::ZERO)).unwrap();
        drop(socket);

        poll_until(&mut hive, |_| count(&log, |e| matches!(e, Event::Error(..))) == 1);
        assert!(log
            .borrow()
            .contains(&Event::Error(conn, ConnectionError::ConnectionReset)));

        let seen = log.borrow().len();
        poll_for(&mut hive, Duration::from_millis(30));
        assert_eq!(log.borrow().len(), seen);
        assert_eq!(hive.connection_state(conn), None);
        assert!(matches!(hive.send(conn, "x"), Err(HiveError::UnknownConnection)));
    }

    #[test]
    fn test_peer_close_delivers_empty_receive() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, true);

        let stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);

        stream.shutdown(std::net::Shutdown::Write).unwrap();
        poll_until(&mut hive, |hive| hive.connection_state(conn).is_none());

        assert_eq!(received(&log), vec![Vec::<u8>::new()]);
        assert_eq!(count(&log, |e| matches!(e, Event::Error(..))), 0);
    }

    #[test]
    fn test_close_flushes_queued_sends() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, false);

        let mut stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);

        hive.send(conn, "bye").unwrap();
        hive.close(conn).unwrap();
        assert!(matches!(hive.send(conn, "late"), Err(HiveError::NotOpen)));
        assert!(matches!(hive.recv(conn), Err(HiveError::ReceivePending | HiveError::NotOpen)));

        poll_until(&mut hive, |hive| hive.connection_state(conn).is_none());

        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"bye");
        assert!(log.borrow().contains(&Event::Send(conn, b"bye".to_vec(), 3)));
    }

    #[test]
    fn test_accept_waits_for_an_offer() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (acceptor, conn, local) = serve(&mut hive, &log, true, true);

        // Withdraw the offer before anyone connects
        hive.close(conn).unwrap();
        poll_until(&mut hive, |hive| hive.connection_state(conn).is_none());

        let stream = client(local);
        let peer = stream.local_addr().unwrap();
        poll_for(&mut hive, Duration::from_millis(50));
        assert!(log.borrow().is_empty());

        // The waiting client is accepted once a Connection is offered
        let next = hive.connection(Recorder::new(&log, true)).unwrap();
        hive.accept(acceptor, next).unwrap();
        poll_until(&mut hive, |_| accepted(&log) == 1);
        assert_eq!(log.borrow()[0], Event::Gate(next, peer));
    }

    #[test]
    fn test_reoffer_after_withdrawn_offer() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (acceptor, conn, local) = serve(&mut hive, &log, true, true);

        // Listener is idle at WouldBlock before the offer is withdrawn
        poll_for(&mut hive, Duration::from_millis(30));
        hive.close(conn).unwrap();

        let next = hive.connection(Recorder::new(&log, true)).unwrap();
        hive.accept(acceptor, next).unwrap();

        let stream = client(local);
        let peer = stream.local_addr().unwrap();
        poll_until(&mut hive, |_| accepted(&log) == 1);
        assert_eq!(log.borrow()[0], Event::Gate(next, peer));
        assert_eq!(hive.connection_state(conn), None);
    }

    #[test]
    fn test_accept_failure_reaches_acceptor() {
        const CHILD: &str = "HIVE_ECHO_ACCEPT_FAILURE_CHILD";
        if std::env::var_os(CHILD).is_none() {
            // Rerun in a child process, the descriptor limit is process-wide
            let output = std::process::Command::new(std::env::current_exe().unwrap())
                .args([
                    "runtime::hive::tests::test_accept_failure_reaches_acceptor",
                    "--exact",
                    "--test-threads=1",
                ])
                .env(CHILD, "1")
                .output()
                .unwrap();
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            assert!(output.status.success(), "{stdout}{stderr}");
            assert!(stdout.contains("1 passed"), "{stdout}");
            return;
        }

        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (acceptor, conn, local) = serve(&mut hive, &log, true, true);
        let _stream = client(local);

        // Cap the descriptor table at its lowest free slot so accept hits EMFILE
        // SAFETY: plain descriptor and rlimit syscalls on owned values.
        let lowest_free = unsafe { libc::dup(libc::STDIN_FILENO) };
        assert!(lowest_free >= 0);
        unsafe { libc::close(lowest_free) };
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
        limit.rlim_cur = lowest_free as libc::rlim_t;
        assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) }, 0);

        poll_until(&mut hive, |_| {
            count(&log, |e| matches!(e, Event::AcceptorError(_))) > 0
        });
        assert_eq!(log.borrow()[0], Event::AcceptorError(AcceptError::Unknown));
        assert_eq!(count(&log, |e| matches!(e, Event::Gate(..))), 0);

        // The offer survives the failed attempt
        assert_eq!(hive.connection_state(conn), Some(ConnState::Offered));
        assert!(matches!(
            hive.accept(acceptor, conn),
            Err(HiveError::NotUnconnected)
        ));
    }

    #[test]
    fn test_offer_rules() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (acceptor, conn, _) = serve(&mut hive, &log, true, true);

        let other = hive.connection(Recorder::new(&log, true)).unwrap();
        assert!(matches!(hive.accept(acceptor, other), Err(HiveError::OfferPending)));
        assert_eq!(hive.connection_state(other), Some(ConnState::Unconnected));

        let second = hive.acceptor(Gate::new(&log, true)).unwrap();
        assert!(matches!(hive.accept(second, conn), Err(HiveError::NotUnconnected)));

        hive.close_acceptor(acceptor).unwrap();
        assert_eq!(hive.connection_state(conn), None);
        assert!(matches!(hive.accept(acceptor, other), Err(HiveError::UnknownAcceptor)));
    }

    #[test]
    fn test_listen_errors() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();

        let first = hive.acceptor(Gate::new(&log, true)).unwrap();
        let local = hive.listen(first, &loopback()).unwrap();
        assert!(matches!(
            hive.listen(first, &loopback()),
            Err(ListenError::Hive(HiveError::AlreadyListening))
        ));

        let second = hive.acceptor(Gate::new(&log, true)).unwrap();
        let taken = Address::new("127.0.0.1", local.port());
        assert!(matches!(
            hive.listen(second, &taken),
            Err(ListenError::Bind { .. })
        ));

        let third = hive.acceptor(Gate::new(&log, true)).unwrap();
        assert!(matches!(
            hive.listen(third, &Address::new("", 4444)),
            Err(ListenError::Address { .. })
        ));
        assert_eq!(hive.local_addr(first), Some(local));
    }

    #[test]
    fn test_connection_capacity() {
        let mut hive = Hive::new(HiveConfig {
            max_connections: 1,
            ..quiet_config()
        })
        .unwrap();
        let log = Log::default();

        hive.connection(Recorder::new(&log, true)).unwrap();
        assert!(matches!(
            hive.connection(Recorder::new(&log, true)),
            Err(HiveError::CapacityExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn test_timers_tick_independently_of_traffic() {
        let interval = Duration::from_millis(20);
        let mut hive = Hive::new(HiveConfig {
            timer_interval: interval,
            ..quiet_config()
        })
        .unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, true);

        let _stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);
        poll_for(&mut hive, Duration::from_millis(150));

        let acceptor_ticks: Vec<_> = log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::AcceptorTimer(delta) => Some(*delta),
                _ => None,
            })
            .collect();
        let connection_ticks: Vec<_> = log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Timer(id, delta) if *id == conn => Some(*delta),
                _ => None,
            })
            .collect();

        assert!(acceptor_ticks.len() >= 2, "acceptor ticks: {acceptor_ticks:?}");
        assert!(connection_ticks.len() >= 2, "connection ticks: {connection_ticks:?}");
        for delta in acceptor_ticks.iter().chain(&connection_ticks) {
            assert!(*delta >= interval);
        }
    }

    #[test]
    fn test_no_timer_after_close() {
        let mut hive = Hive::new(HiveConfig {
            timer_interval: Duration::from_millis(10),
            ..quiet_config()
        })
        .unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, false);

        // The client never reads, so the send keeps the connection closing
        let _stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);
        hive.send(conn, vec![0u8; 64 << 20]).unwrap();
        hive.close(conn).unwrap();
        let closed_at = log.borrow().len();

        poll_for(&mut hive, Duration::from_millis(100));
        assert_eq!(hive.connection_state(conn), Some(ConnState::Closing));
        assert!(!log.borrow()[closed_at..]
            .iter()
            .any(|e| matches!(e, Event::Timer(..))));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, conn, local) = serve(&mut hive, &log, true, true);

        let mut stream = client(local);
        poll_until(&mut hive, |_| accepted(&log) == 1);

        hive.stop();
        hive.stop();
        assert!(hive.is_stopped());
        assert_eq!(hive.poll().unwrap(), 0);
        assert_eq!(hive.connection_count(), 0);
        assert!(matches!(hive.recv(conn), Err(HiveError::Stopped)));
        assert!(matches!(
            hive.connection(Recorder::new(&log, true)),
            Err(HiveError::Stopped)
        ));

        let mut buf = [0u8; 8];
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes after stop"),
        }
    }

    #[test]
    fn test_stop_handle_wakes_poll() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let handle = hive.stop_handle();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
        });

        let start = Instant::now();
        while !hive.is_stopped() {
            assert!(start.elapsed() < Duration::from_secs(5));
            hive.poll_timeout(None).unwrap();
        }
        stopper.join().unwrap();
    }

    #[test]
    fn test_outbound_connect_round_trip() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();
        let (_, server, local) = serve(&mut hive, &log, true, true);

        let dialer = hive.connection(Recorder::new(&log, true)).unwrap();
        hive.connect(dialer, &Address::new("127.0.0.1", local.port()))
            .unwrap();
        assert_eq!(hive.connection_state(dialer), Some(ConnState::Connecting));

        poll_until(&mut hive, |_| {
            accepted(&log) == 1 && count(&log, |e| matches!(e, Event::Connect(..))) == 1
        });
        assert!(log.borrow().contains(&Event::Connect(dialer, local)));

        hive.send(dialer, "ping").unwrap();
        poll_until(&mut hive, |_| {
            log.borrow().contains(&Event::Recv(server, b"ping".to_vec()))
        });

        hive.send(server, "pong").unwrap();
        poll_until(&mut hive, |_| {
            log.borrow().contains(&Event::Recv(dialer, b"pong".to_vec()))
        });
    }

    #[test]
    fn test_connect_refused() {
        let mut hive = Hive::new(quiet_config()).unwrap();
        let log = Log::default();

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let dialer = hive.connection(Recorder::new(&log, true)).unwrap();

        match hive.connect(dialer, &Address::new("127.0.0.1", port)) {
            Ok(()) => {
                poll_until(&mut hive, |hive| hive.connection_state(dialer).is_none());
                assert_eq!(
                    *log.borrow(),
                    vec![Event::Error(dialer, ConnectionError::ConnectionRefused)]
                );
            }
            Err(HiveError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
