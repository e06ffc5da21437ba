use std::time::Duration;

use tokio::time::Instant;

/// Time gate allowing at most one call per interval
///
/// Calls rejected by the gate are not queued, it is up to the caller to try
/// again later.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Try to pass the gate at `now`, returning false if the last accepted
    /// call was less than the interval ago
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// The earliest time the gate will accept a new call
    pub fn next_allowed(&self) -> Option<Instant> {
        self.last.map(|last| last + self.min_interval)
    }
}
