//! Time sources.
//!
//! Everything that depends on wall-clock time (member TTL, time-window rules,
//! daily buckets) reads it through [`Clock`] so tests can pin it.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time in the venue zone
    fn local_now(&self, zone: FixedOffset) -> DateTime<FixedOffset> {
        self.now().with_timezone(&zone)
    }

    /// Current calendar date in the venue zone
    fn today(&self, zone: FixedOffset) -> NaiveDate {
        self.local_now(zone).date_naive()
    }
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
