//! Per-credential monotonic nonce generation
//!
//! Authenticated venues reject a request whose nonce is not strictly
//! greater than the last one they saw for the same API key. Wall-clock
//! time is the natural source but it can stall (two calls inside the same
//! millisecond) or step backwards, so the generator falls back to
//! `last + 1` whenever the clock does not move forward.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Granularity of the epoch value used as nonce candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceUnit {
    Seconds,
    #[default]
    Milliseconds,
}

/// Source of wall-clock time
pub trait EpochClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// `EpochClock` backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl EpochClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Strictly increasing nonce per key.
///
/// One instance is injected into each exchange session; it owns its lock
/// table, so two generators never share state.
pub struct NonceGenerator {
    unit: NonceUnit,
    clock: Arc<dyn EpochClock>,
    last_issued: DashMap<String, Arc<Mutex<u64>>>,
}

impl NonceGenerator {
    pub fn new(unit: NonceUnit) -> Self {
        Self::with_clock(unit, Arc::new(SystemClock))
    }

    pub fn with_clock(unit: NonceUnit, clock: Arc<dyn EpochClock>) -> Self {
        Self {
            unit,
            clock,
            last_issued: DashMap::new(),
        }
    }

    pub fn unit(&self) -> NonceUnit {
        self.unit
    }

    /// Issue the next nonce for `key`.
    ///
    /// Callers for the same key are serialized on that key's slot; the map
    /// shard is only held while looking the slot up, so other keys proceed.
    pub fn next(&self, key: &str) -> u64 {
        let slot = self.slot(key);
        let mut last = slot.lock();

        let candidate = self.current_epoch();
        let issued = if candidate > *last {
            candidate
        } else {
            *last + 1
        };

        *last = issued;
        issued
    }

    /// Last value handed out for `key`, if any
    pub fn last_issued(&self, key: &str) -> Option<u64> {
        self.last_issued.get(key).map(|slot| *slot.lock())
    }

    fn slot(&self, key: &str) -> Arc<Mutex<u64>> {
        if let Some(slot) = self.last_issued.get(key) {
            return slot.clone();
        }
        self.last_issued
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }

    fn current_epoch(&self) -> u64 {
        let now = self.clock.now();
        let value = match self.unit {
            NonceUnit::Seconds => now.timestamp(),
            NonceUnit::Milliseconds => now.timestamp_millis(),
        };
        value.max(0) as u64
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new(NonceUnit::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashSet;

    /// Clock that only moves when told to
    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        fn set(&self, now: DateTime<Utc>) {
            *self.now.lock() = now;
        }
    }

    impl EpochClock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_stalled_clock_still_increases() {
        let clock = Arc::new(ManualClock::at(epoch()));
        let nonces = NonceGenerator::with_clock(NonceUnit::Milliseconds, clock);

        let base = epoch().timestamp_millis() as u64;
        assert_eq!(nonces.next("key"), base);
        assert_eq!(nonces.next("key"), base + 1);
        assert_eq!(nonces.next("key"), base + 2);
        assert_eq!(nonces.last_issued("key"), Some(base + 2));
    }

    #[test]
    fn test_clock_going_backwards() {
        let clock = Arc::new(ManualClock::at(epoch()));
        let nonces = NonceGenerator::with_clock(NonceUnit::Seconds, clock.clone());

        let first = nonces.next("key");
        clock.set(epoch() - ChronoDuration::seconds(30));
        let second = nonces.next("key");
        assert_eq!(second, first + 1);

        clock.set(epoch() + ChronoDuration::seconds(10));
        assert_eq!(nonces.next("key"), first + 10);
    }

    #[test]
    fn test_keys_are_independent() {
        let clock = Arc::new(ManualClock::at(epoch()));
        let nonces = NonceGenerator::with_clock(NonceUnit::Seconds, clock);

        let base = epoch().timestamp() as u64;
        assert_eq!(nonces.next("alpha"), base);
        assert_eq!(nonces.next("alpha"), base + 1);
        assert_eq!(nonces.next("beta"), base);
        assert_eq!(nonces.last_issued("gamma"), None);
    }

    #[test]
    fn test_concurrent_callers_never_share_a_value() {
        let clock = Arc::new(ManualClock::at(epoch()));
        let nonces = Arc::new(NonceGenerator::with_clock(NonceUnit::Milliseconds, clock));
        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let nonces = nonces.clone();
                std::thread::spawn(move || {
                    (0..per_thread).map(|_| nonces.next("shared")).collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let issued = handle.join().unwrap();
            // each caller observes a strictly increasing sequence
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            for value in issued {
                assert!(all.insert(value), "duplicate nonce {}", value);
            }
        }

        assert_eq!(all.len(), threads * per_thread);
        let max = *all.iter().max().unwrap();
        assert_eq!(nonces.last_issued("shared"), Some(max));
    }

    #[test]
    fn test_system_clock_nonce_is_recent() {
        let nonces = NonceGenerator::new(NonceUnit::Milliseconds);
        let before = Utc::now().timestamp_millis() as u64;
        let issued = nonces.next("live");
        assert!(issued >= before);
    }
}
