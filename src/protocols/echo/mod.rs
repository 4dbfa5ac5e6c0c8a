//! Echo service.
//!
//! Raw byte passthrough: every chunk a peer sends comes back unmodified, in
//! order. There is no framing. The connection re-arms its next receive
//! before queueing the echo, so a peer that is slow to read never stalls
//! inbound traffic.
//!
//! The acceptor accepts one client by default; in continuous mode it offers
//! a fresh connection from inside every accept callback.

pub mod handler;

pub use handler::serve;
