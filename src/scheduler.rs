use std::time::Duration;

use chrono::{DateTime, Utc};

/// Decides how long the control loop may sleep before expiring bans.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryScheduler {
    interval: Duration,
}

impl ExpiryScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(100)),
        }
    }

    /// The poll interval, shortened to the earliest pending expiry. An expiry
    /// already in the past means wake now.
    pub fn next_wake(&self, now: DateTime<Utc>, next_expiry: Option<DateTime<Utc>>) -> Duration {
        match next_expiry {
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.interval),
            None => self.interval,
        }
    }
}
