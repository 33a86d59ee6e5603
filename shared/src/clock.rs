use parking_lot::Mutex;
use std::time::{Duration, SystemTime};

/// Time source injected into every TTL-bearing component so that expiry can be
/// driven deterministically in tests. Monotonicity is not required; drift
/// under one TTL is tolerable.
pub trait Clock: Send + Sync {
    fn utc_now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Settable clock for tests.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn utc_now(&self) -> SystemTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH);
        assert_eq!(clock.utc_now(), SystemTime::UNIX_EPOCH);

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            clock.utc_now(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(30)
        );
    }
}
