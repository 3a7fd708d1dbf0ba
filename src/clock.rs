//! Time source for the engine.
//!
//! Every timestamp the engine produces (window entries, block expiry,
//! audit records, alerts) comes from a [`Clock`], so tests can drive time
//! explicitly with [`MockClock`].

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Port for reading the current wall-clock time.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-helpers"))]
mod mock {
    use super::Clock;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Manually advanced clock.
    ///
    /// Clones share the same underlying instant, so advancing one clone
    /// moves every engine component holding another.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        /// Clock starting at a fixed, arbitrary instant.
        pub fn at_epoch() -> Self {
            Self::new(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default())
        }

        pub fn advance(&self, duration: Duration) {
            let mut current = self.current.lock();
            *current += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }

        pub fn set(&self, instant: DateTime<Utc>) {
            *self.current.lock() = instant;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.current.lock()
        }
    }
}
