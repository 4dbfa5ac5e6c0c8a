//! Error taxonomy for the hive.
//!
//! Setup failures (`ListenError`) are returned to the caller. Failures of an
//! in-flight operation are classified (`AcceptError`, `ConnectionError`) and
//! delivered to the owning entity's error callback instead. Misuse of the
//! API is reported synchronously as `HiveError`.

use std::io;
use std::net::SocketAddr;

/// Failure to start listening.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    /// The address is malformed or does not resolve.
    #[error("invalid address '{address}': {reason}")]
    Address { address: String, reason: String },

    /// The address is already in use or unavailable.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listener could not be added to the reactor.
    #[error("failed to register listener: {0}")]
    Register(#[source] io::Error),

    #[error(transparent)]
    Hive(#[from] HiveError),
}

/// Classification of a failed accept attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    #[error("address in use")]
    AddressInUse,
    #[error("permission denied")]
    PermissionDenied,
    #[error("accept aborted")]
    Aborted,
    #[error("unknown accept error")]
    Unknown,
}

impl From<&io::Error> for AcceptError {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => AcceptError::AddressInUse,
            io::ErrorKind::PermissionDenied => AcceptError::PermissionDenied,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                AcceptError::Aborted
            }
            _ => AcceptError::Unknown,
        }
    }
}

/// Classification of a failed connection operation.
///
/// Terminal for the Connection it is reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("unknown connection error")]
    Unknown,
}

impl From<&io::Error> for ConnectionError {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ConnectionError::ConnectionReset,
            io::ErrorKind::ConnectionRefused => ConnectionError::ConnectionRefused,
            io::ErrorKind::TimedOut => ConnectionError::Timeout,
            io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => ConnectionError::Closed,
            _ => ConnectionError::Unknown,
        }
    }
}

/// Contract violations reported synchronously by hive operations.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("unknown or released connection")]
    UnknownConnection,

    #[error("unknown or released acceptor")]
    UnknownAcceptor,

    /// `recv` called while a receive is already armed.
    #[error("a receive is already pending")]
    ReceivePending,

    #[error("connection is not open")]
    NotOpen,

    /// The Connection was already offered, dialed, or opened.
    #[error("connection is already in use")]
    NotUnconnected,

    #[error("acceptor is not listening")]
    NotListening,

    #[error("acceptor is already listening")]
    AlreadyListening,

    /// The Acceptor already holds an offered Connection.
    #[error("acceptor already has a pending offer")]
    OfferPending,

    #[error("connection capacity exhausted ({capacity})")]
    CapacityExhausted { capacity: usize },

    #[error("hive is stopped")]
    Stopped,

    #[error(transparent)]
    Io(#[from] io::Error),
}
