//! Human-readable event log.
//!
//! Every record (a tagged line, optionally followed by a hex dump) is written
//! and flushed while holding one lock, so records from different callbacks
//! never interleave even if they are emitted from several threads.

use chrono::TimeDelta;
use std::fmt::{Display, Write as _};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Bytes per hex dump line.
const DUMP_WIDTH: usize = 16;

/// Serialized writer for `[OnAccept]`-style event lines.
pub struct Console {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    pub fn accept(&self, peer: SocketAddr) {
        self.emit(&format!("[OnAccept] {}:{}\n", peer.ip(), peer.port()));
    }

    pub fn connect(&self, peer: SocketAddr) {
        self.emit(&format!("[OnConnect] {}:{}\n", peer.ip(), peer.port()));
    }

    pub fn send(&self, data: &[u8]) {
        self.emit(&traffic("OnSend", data));
    }

    pub fn recv(&self, data: &[u8]) {
        self.emit(&traffic("OnRecv", data));
    }

    pub fn timer(&self, delta: Duration) {
        self.emit(&format!("[OnTimer] {}\n", format_delta(delta)));
    }

    pub fn error(&self, error: &dyn Display) {
        self.emit(&format!("[OnError] {error}\n"));
    }

    fn emit(&self, record: &str) {
        // A panic elsewhere must not silence the log
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = out.write_all(record.as_bytes()).and_then(|()| out.flush()) {
            warn!(error = %e, "Console write failed");
        }
    }
}

fn traffic(tag: &str, data: &[u8]) -> String {
    let mut record = format!("[{tag}] {} bytes\n", data.len());
    record.push_str(&hex_dump(data));
    record
}

/// Lowercase hex, 16 bytes per line, every line newline-terminated.
pub fn hex_dump(data: &[u8]) -> String {
    let mut dump = String::with_capacity(data.len() * 3 + data.len() / DUMP_WIDTH + 1);
    for line in data.chunks(DUMP_WIDTH) {
        for (i, byte) in line.iter().enumerate() {
            if i > 0 {
                dump.push(' ');
            }
            let _ = write!(dump, "{byte:02x}");
        }
        dump.push('\n');
    }
    dump
}

/// `HH:MM:SS.ffffff`, microsecond resolution.
pub fn format_delta(delta: Duration) -> String {
    let delta = TimeDelta::from_std(delta).unwrap_or(TimeDelta::MAX);
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        delta.num_hours(),
        delta.num_minutes() % 60,
        delta.num_seconds() % 60,
        delta.subsec_nanos() / 1_000
    )
}

/// In-memory writer shared between a `Console` and a test.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct Captured(std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Captured {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
