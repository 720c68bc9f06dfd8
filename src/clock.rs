use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// Retention windows and peer freshness checks all go through this trait so
/// tests can drive expiry without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test support: a clock that only moves when told to.
pub mod test_clock {
    use super::*;
    use std::sync::Mutex;

    /// Manually advanced clock for tests.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            ManualClock {
                now: Mutex::new(start),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += delta;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
