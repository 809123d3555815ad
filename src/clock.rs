use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::timestamp::Timestamp;

/// A source of wall-clock time for rotation decisions.
///
/// Idle rotation compares this clock against the last rotation; tests swap in
/// a [`ManualClock`] to move time without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// A clock that uses `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    raw: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            raw: Arc::new(AtomicU64::new(start.raw())),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.raw.store(now.raw(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let now = self.now();
        let next = Timestamp::from_duration(now.as_duration() + by);
        self.set(next);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_raw(self.raw.load(Ordering::SeqCst))
    }
}
