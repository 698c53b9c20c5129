//! # Time Source
//!
//! Abstract clock injected into every timestamp-consuming component.
//! Production uses [`SystemTimeSource`]; tests use a controllable clock
//! instead of mutating process-wide state.

use crate::entities::Timestamp;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstract interface for reading the current time.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    /// Create a system time source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Timestamp::from_millis(millis)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use controllable::ControllableTimeSource;

#[cfg(any(test, feature = "test-utils"))]
mod controllable {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Thread-safe time source for tests requiring time advancement.
    ///
    /// Uses `AtomicU64` so it can be shared behind an `Arc` and advanced
    /// while components read it.
    #[derive(Debug, Default)]
    pub struct ControllableTimeSource {
        millis: AtomicU64,
    }

    impl ControllableTimeSource {
        /// Start the clock at `millis`.
        #[must_use]
        pub fn new(millis: u64) -> Self {
            Self {
                millis: AtomicU64::new(millis),
            }
        }

        /// Advance the clock.
        pub fn advance(&self, millis: u64) {
            self.millis.fetch_add(millis, Ordering::SeqCst);
        }

        /// Jump to an absolute time.
        pub fn set(&self, millis: u64) {
            self.millis.store(millis, Ordering::SeqCst);
        }
    }

    impl TimeSource for ControllableTimeSource {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
        }
    }
}
