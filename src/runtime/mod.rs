//! Single-threaded readiness reactor for TCP services.
//!
//! The `Hive` owns every Acceptor and Connection in slab-backed registries
//! and hands out generational handles. Applications plug in behaviour
//! through `AcceptorHandler` and `ConnectionHandler`; all callbacks of one
//! hive run on the thread that calls `Hive::poll`, never concurrently.
//!
//! Uses mio, so epoll on Linux and kqueue on macOS.

mod acceptor;
mod address;
mod connection;
mod error;
mod handler;
mod hive;
mod timer;
mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use address::Address;
#[allow(unused_imports)] // Part of the hive API, unused by the echo binary
pub use connection::ConnState;
pub use error::{AcceptError, ConnectionError, HiveError, ListenError};
pub use handler::{AcceptorHandler, ConnectionHandler, SendCompletion};
pub use hive::{Hive, HiveConfig};
#[allow(unused_imports)]
pub use hive::StopHandle;
pub use token::{AcceptorId, ConnectionId};
