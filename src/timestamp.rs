//! 32.32 fixed-point capture timestamps.
//!
//! The upper 32 bits hold seconds since the Unix epoch, the lower 32 bits a
//! binary fraction of a second. This is the ERF on-disk representation, and
//! plain integer comparison gives chronological order.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FRAC_BITS: u32 = 32;
const FRAC_ONE: u64 = 1 << FRAC_BITS;
const FRAC_MASK: u64 = FRAC_ONE - 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn from_secs(secs: u32) -> Self {
        Self((secs as u64) << FRAC_BITS)
    }

    pub fn from_micros(secs: u32, usecs: u32) -> Self {
        Self::from_parts(secs, usecs as u64, 1_000_000)
    }

    pub fn from_nanos(secs: u32, nsecs: u32) -> Self {
        Self::from_parts(secs, nsecs as u64, 1_000_000_000)
    }

    /// Seconds since the epoch; anything past 2106 saturates.
    pub fn from_duration(since_epoch: Duration) -> Self {
        let secs = u32::try_from(since_epoch.as_secs()).unwrap_or(u32::MAX);
        Self::from_nanos(secs, since_epoch.subsec_nanos())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self::from_duration(since_epoch)
    }

    fn from_parts(secs: u32, sub: u64, per_sec: u64) -> Self {
        let sub = sub.min(per_sec - 1);
        let frac = (sub << FRAC_BITS) / per_sec;
        Self(((secs as u64) << FRAC_BITS) | frac)
    }

    pub const fn secs(self) -> u32 {
        (self.0 >> FRAC_BITS) as u32
    }

    pub const fn fraction(self) -> u32 {
        (self.0 & FRAC_MASK) as u32
    }

    pub fn subsec_micros(self) -> u32 {
        Self::scale_fraction(self.fraction(), 1_000_000)
    }

    pub fn subsec_nanos(self) -> u32 {
        Self::scale_fraction(self.fraction(), 1_000_000_000)
    }

    fn scale_fraction(frac: u32, per_sec: u64) -> u32 {
        let scaled = ((frac as u64) * per_sec + (FRAC_ONE >> 1)) >> FRAC_BITS;
        // rounding can reach a full second; stay just below it
        scaled.min(per_sec - 1) as u32
    }

    pub fn as_duration(self) -> Duration {
        Duration::new(self.secs() as u64, self.subsec_nanos())
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / FRAC_ONE as f64
    }

    /// Elapsed time from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0);
        let secs = delta >> FRAC_BITS;
        let nanos = Self::scale_fraction((delta & FRAC_MASK) as u32, 1_000_000_000);
        Duration::new(secs, nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs(), self.subsec_micros())
    }
}
