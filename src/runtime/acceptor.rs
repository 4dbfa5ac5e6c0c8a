//! Acceptor state machine.
//!
//! `Idle -> Listening -> (Accepting <-> Listening) -> Closed`. An acceptor
//! only completes an accept while it holds an offered Connection, and each
//! completed accept consumes exactly one offer.

use crate::runtime::handler::AcceptorHandler;
use crate::runtime::timer::Ticker;
use crate::runtime::{ConnectionId, HiveError};
use mio::net::TcpListener;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    Listening,
    /// Listening with a Connection offered for the next accept.
    Accepting,
    Closed,
}

pub struct Acceptor {
    pub state: AcceptorState,
    pub listener: Option<TcpListener>,
    pub local: Option<SocketAddr>,
    offer: Option<ConnectionId>,
    /// Readiness cached from the reactor, cleared on `WouldBlock`.
    pub readable: bool,
    /// Already in the hive's ready queue.
    pub queued: bool,
    pub ticker: Option<Ticker>,
    /// Taken out while one of its callbacks runs.
    pub handler: Option<Box<dyn AcceptorHandler>>,
}

impl Acceptor {
    pub fn new(handler: Box<dyn AcceptorHandler>) -> Self {
        Self {
            state: AcceptorState::Idle,
            listener: None,
            local: None,
            offer: None,
            readable: false,
            queued: false,
            ticker: None,
            handler: Some(handler),
        }
    }

    /// Start listening on an already bound and registered listener.
    pub fn listen(&mut self, listener: TcpListener, local: SocketAddr, ticker: Option<Ticker>) {
        self.listener = Some(listener);
        self.local = Some(local);
        self.ticker = ticker;
        // Connections may already be waiting in the backlog
        self.readable = true;
        self.state = if self.offer.is_some() {
            AcceptorState::Accepting
        } else {
            AcceptorState::Listening
        };
    }

    /// Offer a Connection as the target of the next accept.
    ///
    /// Offers made before `listen` are kept and served once listening starts.
    pub fn offer(&mut self, conn: ConnectionId) -> Result<(), HiveError> {
        match self.state {
            AcceptorState::Closed => Err(HiveError::NotListening),
            _ if self.offer.is_some() => Err(HiveError::OfferPending),
            AcceptorState::Idle => {
                self.offer = Some(conn);
                Ok(())
            }
            _ => {
                self.offer = Some(conn);
                self.state = AcceptorState::Accepting;
                Ok(())
            }
        }
    }

    pub fn pending_offer(&self) -> Option<ConnectionId> {
        self.offer
    }

    /// Consume the offer after a completed accept.
    pub fn take_offer(&mut self) -> Option<ConnectionId> {
        let offer = self.offer.take();
        if self.state == AcceptorState::Accepting {
            self.state = AcceptorState::Listening;
        }
        offer
    }

    /// Whether an accept attempt could complete now.
    pub fn can_accept(&self) -> bool {
        self.state == AcceptorState::Accepting && self.readable
    }

    /// Release the listener, returning the offer that can no longer complete.
    pub fn close(&mut self) -> Option<ConnectionId> {
        self.state = AcceptorState::Closed;
        self.listener = None;
        self.ticker = None;
        self.offer.take()
    }
}
