//! Periodic tick schedule for Acceptors and Connections.

use std::time::{Duration, Instant};

/// Fires at a fixed interval and reports the time since the previous tick.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    interval: Duration,
    last: Instant,
    next: Instant,
}

impl Ticker {
    /// Start a schedule whose first tick is one interval after `now`.
    ///
    /// Returns `None` for a zero interval, which disables ticking.
    pub fn start(interval: Duration, now: Instant) -> Option<Self> {
        if interval.is_zero() {
            return None;
        }
        Some(Self {
            interval,
            last: now,
            next: now + interval,
        })
    }

    /// When the next tick is due.
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Consume a due tick, returning the elapsed time since the previous one.
    ///
    /// Missed ticks are coalesced: a late poll yields one tick with the full
    /// elapsed duration and the schedule restarts from `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Duration> {
        if now < self.next {
            return None;
        }
        let delta = now.saturating_duration_since(self.last);
        self.last = now;
        self.next = now + self.interval;
        Some(delta)
    }
}
