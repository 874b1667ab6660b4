//! Wall-clock source shared by token verification, session touch and sweep.
//! Production code uses `SystemClock`; tests drive `ManualClock` so expiry
//! and eviction can be checked without sleeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self { Self { now: Mutex::new(start) } }

    pub fn set(&self, at: DateTime<Utc>) { *self.now.lock() = at; }

    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }
}

impl Default for ManualClock {
    fn default() -> Self { Self::new(Utc::now()) }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock() }
}

/// Elapsed time from `earlier` to `later`, clamped at zero.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    later.signed_duration_since(earlier).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let c = ManualClock::new(start);
        c.advance(Duration::from_secs(90));
        assert_eq!(c.now() - start, TimeDelta::seconds(90));
    }

    #[test]
    fn elapsed_clamps_negative() {
        let now = Utc::now();
        let later = now + TimeDelta::seconds(5);
        assert_eq!(elapsed_between(later, now), Duration::ZERO);
        assert_eq!(elapsed_between(now, later), Duration::from_secs(5));
    }
}
