//! hive-echo: a reactor-driven TCP echo server
//!
//! Accepts inbound TCP connections and echoes every received byte back to
//! the sender. Lifecycle and traffic events are written to stdout as tagged
//! lines with hex dumps; diagnostics go to stderr through `tracing`.
//!
//! Features:
//! - Single-threaded mio reactor (epoll on Linux, kqueue on macOS)
//! - Periodic timer callbacks per acceptor and connection
//! - Stops on any keypress
//! - Configuration via CLI arguments or TOML file

mod config;
mod console;
mod protocols;
mod runtime;
mod terminal;

use config::Config;
use console::Console;
use runtime::Hive;
use std::sync::Arc;
use terminal::RawMode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to the console
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        continuous = config.continuous,
        timer_interval = ?config.timer_interval,
        buffer_size = config.buffer_size,
        "Starting hive-echo server"
    );

    let mut hive = Hive::new(config.hive())?;
    let console = Arc::new(Console::stdout());
    let local = protocols::echo::serve(&mut hive, &config.address(), console, config.continuous)?;
    info!(addr = %local, "Press any key to stop");

    let raw = match RawMode::enable() {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!(error = %e, "Stdin is not a terminal; keypress detection may need Enter");
            None
        }
    };

    let result = run(&mut hive, &config);

    drop(raw);
    hive.stop();
    result?;
    Ok(())
}

/// Poll until a key is pressed.
fn run(hive: &mut Hive, config: &Config) -> std::io::Result<()> {
    while !terminal::key_pressed() {
        hive.poll_timeout(Some(config.poll_interval))?;
    }
    info!("Key pressed, shutting down");
    Ok(())
}
