// ── Logical time ──

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, as reported by whichever source
/// produced an observation. Only ordering matters to the core.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly increasing local clock.
///
/// Tracks wall-clock milliseconds but never repeats or goes backwards, so
/// `created_at` orders operations even when several are created within
/// the same millisecond or the device clock is adjusted.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp.
    pub fn now(&self) -> Timestamp {
        let wall = wall_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Advance past a timestamp seen elsewhere (e.g. a restored operation).
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen.0, Ordering::AcqRel);
    }
}

fn wall_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = LogicalClock::new();
        let mut prev = clock.now();
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn observe_moves_clock_past_future_timestamps() {
        let clock = LogicalClock::new();
        let far = Timestamp::from_millis(wall_millis() + 3_600_000);
        clock.observe(far);
        assert!(clock.now() > far);
    }

    #[test]
    fn observe_never_moves_clock_backwards() {
        let clock = LogicalClock::new();
        let issued = clock.now();
        clock.observe(Timestamp::from_millis(1));
        assert!(clock.now() > issued);
    }
}
