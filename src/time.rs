//! Logical time used to order transaction start points.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A logical timestamp. Ordering transaction start times is its only use.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Creates a new timestamp with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of the timestamp.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Source of monotonically non-decreasing timestamps.
///
/// The manager reads one timestamp per `start_transaction`; deadlock victim
/// selection compares them, so two providers must never be mixed on one
/// manager.
pub trait TimeProvider: Send + Sync {
    /// Returns the current logical time.
    fn current_time(&self) -> Timestamp;
}

/// A time provider backed by an atomic counter.
///
/// Every call returns a strictly greater timestamp, so transaction start
/// times are totally ordered without touching the system clock.
#[derive(Debug)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Creates a clock starting at a specific value.
    pub fn with_start(start: u64) -> Self {
        Self {
            last: AtomicU64::new(start),
        }
    }
}

impl TimeProvider for LogicalClock {
    fn current_time(&self) -> Timestamp {
        let ts = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        Timestamp::new(ts)
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A time provider reading the system clock as microseconds since the epoch,
/// clamped so observed values never go backwards.
#[derive(Debug, Default)]
pub struct SystemTimeProvider {
    last: AtomicU64,
}

impl SystemTimeProvider {
    /// Creates a new system-clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn current_time(&self) -> Timestamp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let prev = self.last.fetch_max(now, Ordering::SeqCst);
        Timestamp::new(now.max(prev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1) < Timestamp::new(2));
        assert_eq!(Timestamp::new(3), Timestamp::new(3));
        assert_eq!(format!("{}", Timestamp::new(5)), "Timestamp(5)");
    }

    #[test]
    fn test_logical_clock_strictly_increasing() {
        let clock = LogicalClock::new();

        let t1 = clock.current_time();
        let t2 = clock.current_time();
        let t3 = clock.current_time();

        assert!(t1 < t2);
        assert!(t2 < t3);
        assert_eq!(t1.value(), 1);
    }

    #[test]
    fn test_logical_clock_with_start() {
        let clock = LogicalClock::with_start(100);
        assert_eq!(clock.current_time().value(), 101);
    }

    #[test]
    fn test_logical_clock_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let clock = Arc::new(LogicalClock::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                let mut times = vec![];
                for _ in 0..100 {
                    times.push(clock.current_time());
                }
                times
            }));
        }

        let mut all_times = vec![];
        for handle in handles {
            all_times.extend(handle.join().unwrap());
        }

        let mut unique: Vec<_> = all_times.iter().map(|t| t.value()).collect();
        unique.sort();
        unique.dedup();

        assert_eq!(all_times.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }

    #[test]
    fn test_system_time_provider_non_decreasing() {
        let provider = SystemTimeProvider::new();

        let mut previous = provider.current_time();
        for _ in 0..100 {
            let next = provider.current_time();
            assert!(next >= previous);
            previous = next;
        }
    }
}
