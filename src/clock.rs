//! Time source for `now`, expiry computation and expiry checks.
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::types::TimeStamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        Utc::now().into()
    }
}

/// A clock that only moves when told to. Used to drive expiry deterministically.
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
    /// Move forward by `delta`. Out-of-range moves leave the clock where it is.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock();
        if let Some(next) = now.checked_add_signed(delta) {
            *now = next;
        }
    }
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        (*self.now.lock()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        assert_eq!(t0, clock.now());

        clock.advance(TimeDelta::minutes(5));
        assert_eq!(Some(clock.now()), t0.after(TimeDelta::minutes(5)));
    }
}
