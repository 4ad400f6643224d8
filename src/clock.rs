use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Wall-clock source. Every time-driven decision (decay, expiry, closing
/// windows) reads through this so tests can pin and advance time.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests and replay tooling.
pub struct ManualTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}
