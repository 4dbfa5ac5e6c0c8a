//! Host/port pair used to listen and dial.

use crate::runtime::ListenError;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// An unresolved `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first matching socket address.
    pub fn resolve(&self) -> Result<SocketAddr, ListenError> {
        let invalid = |reason: String| ListenError::Address {
            address: self.to_string(),
            reason,
        };

        if self.host.is_empty() {
            return Err(invalid("empty host".to_string()));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(invalid("host contains whitespace".to_string()));
        }

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("no addresses found".to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
