//! Keyed registry of sliding window counters with generational eviction.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::counter::{Limit, SlidingWindowCounter};
use crate::error::{Result, StarguardError};

/// When a registry discards idle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Checked on every call. Rotation epochs are `period` long and aligned
    /// to the registry's creation time.
    Lazy { period: Duration },
    /// Performed unconditionally by a background task every `interval`.
    /// See [`WindowedLimiterRegistry::spawn_scheduled_rotation`].
    Scheduled { interval: Duration },
}

impl Rotation {
    /// Length of one rotation epoch.
    pub fn period(&self) -> Duration {
        match *self {
            Rotation::Lazy { period } => period,
            Rotation::Scheduled { interval } => interval,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The event may proceed and has been counted.
    Allowed,
    /// The event was not counted. `retry_after` estimates when the key
    /// will be admitted again.
    Limited { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match *self {
            Admission::Allowed => Duration::ZERO,
            Admission::Limited { retry_after } => retry_after,
        }
    }
}

/// Two generations of counters, without any locking.
///
/// Suitable on its own when all access happens from one task. Shared
/// access goes through [`WindowedLimiterRegistry`].
#[derive(Debug)]
pub struct CounterTable<K> {
    active: HashMap<K, SlidingWindowCounter>,
    retiring: HashMap<K, SlidingWindowCounter>,
    rotation: Rotation,
    last_rotation: Instant,
}

impl<K: Eq + Hash + Debug> CounterTable<K> {
    /// Create an empty table whose first rotation epoch starts at `now`.
    pub fn new(rotation: Rotation, now: Instant) -> Result<Self> {
        if rotation.period().is_zero() {
            return Err(StarguardError::Config(
                "rotation period must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            active: HashMap::new(),
            retiring: HashMap::new(),
            rotation,
            last_rotation: now,
        })
    }

    /// Count one event for `key` if its window has room.
    pub fn trigger(&mut self, key: K, limit: Limit, now: Instant) -> bool {
        self.acquire(key, limit, now).is_allowed()
    }

    /// Like [`trigger`](Self::trigger), reporting how long a rejected key
    /// has to wait.
    pub fn acquire(&mut self, key: K, limit: Limit, now: Instant) -> Admission {
        self.maybe_rotate(now);

        trace!(key = ?key, "Checking admission");

        let counter = self.get_or_create(key, limit, now);
        if counter.try_acquire(now) {
            return Admission::Allowed;
        }

        let retry_after = counter.retry_after(now);
        debug!(
            capacity = counter.limit().capacity(),
            current = counter.current_count(),
            previous = counter.previous_count(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        Admission::Limited { retry_after }
    }

    /// Find the counter for `key`, creating it in the active generation.
    ///
    /// A counter found only in the retiring generation is moved to the
    /// active one, so it survives the next rotation. `limit` only applies
    /// when a new counter is created.
    pub fn get_or_create(
        &mut self,
        key: K,
        limit: Limit,
        now: Instant,
    ) -> &mut SlidingWindowCounter {
        let retiring = &mut self.retiring;
        self.active.entry(key).or_insert_with_key(|key| match retiring.remove(key) {
            Some(counter) => counter,
            None => {
                debug!(
                    key = ?key,
                    capacity = limit.capacity(),
                    period_ms = limit.period().as_millis() as u64,
                    "Creating new rate limit counter"
                );
                SlidingWindowCounter::new(limit, now)
            }
        })
    }

    /// Apply lazy rotation for the epochs that have passed since the last
    /// rotation. Does nothing for scheduled rotation.
    ///
    /// One elapsed epoch retires the active generation. Two or more mean
    /// every counter has been idle for at least a full epoch, so both
    /// generations are dropped.
    pub fn maybe_rotate(&mut self, now: Instant) {
        let Rotation::Lazy { period } = self.rotation else {
            return;
        };

        let elapsed = now.saturating_duration_since(self.last_rotation);
        if elapsed < period {
            return;
        }

        let epochs = (elapsed.as_nanos() / period.as_nanos()).min(u32::MAX as u128) as u32;
        self.last_rotation += period * epochs;

        if epochs == 1 {
            self.swap_generations();
        } else {
            debug!(
                active = self.active.len(),
                retiring = self.retiring.len(),
                epochs,
                "Dropping both counter generations"
            );
            self.active = HashMap::new();
            self.retiring = HashMap::new();
        }
    }

    /// Retire the active generation unconditionally.
    pub fn rotate(&mut self, now: Instant) {
        self.swap_generations();
        self.last_rotation = now;
    }

    fn swap_generations(&mut self) {
        debug!(
            promoted = self.active.len(),
            discarded = self.retiring.len(),
            "Rotating counter generations"
        );
        self.retiring = mem::take(&mut self.active);
    }

    /// Whether `key` has a counter in either generation.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.active.contains_key(key) || self.retiring.contains_key(key)
    }

    /// Look at the counter for `key` without promoting it.
    pub fn peek<Q>(&self, key: &Q) -> Option<&SlidingWindowCounter>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.active.get(key).or_else(|| self.retiring.get(key))
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.retiring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.retiring.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn retiring_len(&self) -> usize {
        self.retiring.len()
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Forget every counter.
    pub fn clear(&mut self) {
        self.active.clear();
        self.retiring.clear();
    }
}

/// Generation sizes of a registry, for reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub name: &'static str,
    pub active: usize,
    pub retiring: usize,
}

/// Thread-safe registry of rate limit counters for one use case.
///
/// A single mutex covers each whole call (rotation check, lookup,
/// creation, promotion and the admission itself), so concurrent events
/// for the same key are serialized and none are lost between the existence
/// check and the insert.
pub struct WindowedLimiterRegistry<K> {
    name: &'static str,
    table: Mutex<CounterTable<K>>,
}

impl<K: Eq + Hash + Debug> WindowedLimiterRegistry<K> {
    /// Create a named registry. The name only appears in logs and stats.
    pub fn new(name: &'static str, rotation: Rotation) -> Result<Self> {
        Ok(Self {
            name,
            table: Mutex::new(CounterTable::new(rotation, Instant::now())?),
        })
    }

    /// Returns `true` and counts the event if `key` is under `limit`.
    pub fn trigger(&self, key: K, limit: Limit, now: Instant) -> bool {
        self.acquire(key, limit, now).is_allowed()
    }

    /// Admission check that also reports a retry-after when limited.
    pub fn acquire(&self, key: K, limit: Limit, now: Instant) -> Admission {
        let admission = self.table.lock().acquire(key, limit, now);
        if !admission.is_allowed() {
            trace!(registry = self.name, "Event rejected");
        }
        admission
    }

    /// Run `f` on the counter for `key` while holding the registry lock.
    ///
    /// Creates or promotes the counter exactly as
    /// [`CounterTable::get_or_create`] does.
    pub fn with_counter<R>(
        &self,
        key: K,
        limit: Limit,
        now: Instant,
        f: impl FnOnce(&mut SlidingWindowCounter) -> R,
    ) -> R {
        let mut table = self.table.lock();
        table.maybe_rotate(now);
        f(table.get_or_create(key, limit, now))
    }

    /// Retire the active generation now.
    pub fn rotate(&self, now: Instant) {
        self.table.lock().rotate(now);
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.table.lock().contains(key)
    }

    /// Current estimate for `key`, or `None` if it has no counter.
    pub fn estimated<Q>(&self, key: &Q, now: Instant) -> Option<f64>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.table.lock().peek(key).map(|counter| counter.estimated(now))
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.table.lock().active_len()
    }

    pub fn retiring_len(&self) -> usize {
        self.table.lock().retiring_len()
    }

    pub fn stats(&self) -> RegistryStats {
        let table = self.table.lock();
        RegistryStats {
            name: self.name,
            active: table.active_len(),
            retiring: table.retiring_len(),
        }
    }

    pub fn rotation(&self) -> Rotation {
        self.table.lock().rotation()
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

impl<K> WindowedLimiterRegistry<K>
where
    K: Eq + Hash + Debug + Send + 'static,
{
    /// Start the background rotation task for a scheduled registry.
    ///
    /// Returns `Ok(None)` for lazily rotated registries, and an error when
    /// called outside a tokio runtime. The task holds only a weak reference
    /// and stops once the registry is dropped.
    pub fn spawn_scheduled_rotation(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        let Rotation::Scheduled { interval } = self.rotation() else {
            return Ok(None);
        };
        let runtime = Handle::try_current()?;

        let registry = Arc::downgrade(self);
        let name = self.name;
        debug!(
            registry = name,
            interval_ms = interval.as_millis() as u64,
            "Starting scheduled rotation"
        );

        Ok(Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!(registry = name, "Registry dropped, stopping scheduled rotation");
                    break;
                };
                registry.rotate(Instant::now());
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn limit(capacity: u32, period_secs: f64) -> Limit {
        Limit::from_secs_f64(capacity, period_secs).unwrap()
    }

    fn lazy_table(period_secs: f64, t0: Instant) -> CounterTable<&'static str> {
        CounterTable::new(Rotation::Lazy { period: secs(period_secs) }, t0).unwrap()
    }

    #[test]
    fn test_zero_rotation_period_is_rejected() {
        let lazy = Rotation::Lazy {
            period: Duration::ZERO,
        };
        let result = CounterTable::<u64>::new(lazy, Instant::now());
        assert!(matches!(result, Err(StarguardError::Config(_))));

        let scheduled = Rotation::Scheduled {
            interval: Duration::ZERO,
        };
        assert!(WindowedLimiterRegistry::<u64>::new("test", scheduled).is_err());
    }

    #[test]
    fn test_admission_bound_at_single_instant() {
        let t0 = Instant::now();
        let mut table = lazy_table(60.0, t0);

        for _ in 0..5 {
            assert!(table.trigger("guild", limit(5, 10.0), t0));
        }
        assert!(!table.trigger("guild", limit(5, 10.0), t0));
    }

    #[test]
    fn test_keys_are_independent() {
        let t0 = Instant::now();
        let mut table = lazy_table(60.0, t0);

        assert!(table.trigger("a", limit(1, 10.0), t0));
        assert!(!table.trigger("a", limit(1, 10.0), t0));
        assert!(table.trigger("b", limit(1, 10.0), t0));
    }

    #[test]
    fn test_first_limit_is_sticky() {
        let t0 = Instant::now();
        let mut table = lazy_table(60.0, t0);

        assert!(table.trigger("k", limit(1, 10.0), t0));
        // A larger limit on a later call does not replace the stored one.
        assert!(!table.trigger("k", limit(100, 10.0), t0));
        assert_eq!(table.peek("k").unwrap().limit().capacity(), 1);
    }

    #[test]
    fn test_acquire_reports_retry_after() {
        let t0 = Instant::now();
        let mut table = lazy_table(60.0, t0);

        for t in [0.0, 1.0, 2.0, 3.0, 4.0] {
            assert_eq!(table.acquire("k", limit(5, 10.0), t0 + secs(t)), Admission::Allowed);
        }

        let admission = table.acquire("k", limit(5, 10.0), t0 + secs(4.5));
        assert!(!admission.is_allowed());
        assert!(admission.retry_after() > secs(5.0));
        assert!(admission.retry_after() <= secs(6.0));

        assert!(table.acquire("k", limit(5, 10.0), t0 + secs(10.1)).is_allowed());
    }

    #[test]
    fn test_rejections_do_not_mutate_count() {
        let t0 = Instant::now();
        let mut table = lazy_table(60.0, t0);

        table.trigger("k", limit(2, 10.0), t0);
        table.trigger("k", limit(2, 10.0), t0);
        for _ in 0..10 {
            assert!(!table.trigger("k", limit(2, 10.0), t0 + secs(1.0)));
        }
        assert_eq!(table.peek("k").unwrap().current_count(), 2);
    }

    #[test]
    fn test_single_epoch_moves_active_to_retiring() {
        let t0 = Instant::now();
        let mut table = lazy_table(10.0, t0);

        table.trigger("idle", limit(5, 1.0), t0);
        assert_eq!(table.active_len(), 1);

        table.trigger("other", limit(5, 1.0), t0 + secs(10.5));
        assert_eq!(table.retiring_len(), 1);
        assert_eq!(table.active_len(), 1);
        assert!(table.contains("idle"));
    }

    #[test]
    fn test_access_promotes_out_of_retiring() {
        let t0 = Instant::now();
        let mut table = lazy_table(10.0, t0);

        table.trigger("k", limit(5, 100.0), t0);
        table.rotate(t0);
        assert_eq!(table.retiring_len(), 1);
        assert_eq!(table.active_len(), 0);

        let counter = table.get_or_create("k", limit(5, 100.0), t0 + secs(1.0));
        assert_eq!(counter.current_count(), 1);
        assert_eq!(table.retiring_len(), 0);
        assert_eq!(table.active_len(), 1);
    }

    #[test]
    fn test_idle_key_is_evicted_after_two_periods() {
        let t0 = Instant::now();
        let mut table = lazy_table(10.0, t0);

        table.trigger("idle", limit(5, 1.0), t0 + secs(9.9));
        table.maybe_rotate(t0 + secs(9.9 + 20.1));
        assert!(!table.contains("idle"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_idle_key_in_retiring_is_evicted() {
        let t0 = Instant::now();
        let mut table = lazy_table(10.0, t0);

        table.trigger("idle", limit(5, 1.0), t0 + secs(9.9));
        table.trigger("busy", limit(5, 1.0), t0 + secs(19.9));
        assert_eq!(table.retiring_len(), 1);

        table.trigger("busy", limit(5, 1.0), t0 + secs(29.9));
        assert!(!table.contains("idle"));
        assert!(table.contains("busy"));
    }

    #[test]
    fn test_key_touched_every_period_keeps_state() {
        let t0 = Instant::now();
        let mut table = lazy_table(10.0, t0);
        let long = limit(1_000, 3600.0);

        for i in 0..50 {
            assert!(table.trigger("k", long, t0 + secs(i as f64 * 10.0)));
        }

        let counter = table.peek("k").unwrap();
        assert_eq!(counter.current_count(), 50);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_registry_with_counter_holds_state() {
        let t0 = Instant::now();
        let registry =
            WindowedLimiterRegistry::new("test", Rotation::Lazy { period: secs(60.0) }).unwrap();

        assert!(registry.trigger(1u64, limit(3, 10.0), t0));
        let count = registry.with_counter(1u64, limit(3, 10.0), t0, |c| c.current_count());
        assert_eq!(count, 1);
        assert_eq!(registry.estimated(&1u64, t0), Some(1.0));
        assert_eq!(registry.estimated(&2u64, t0), None);

        let stats = registry.stats();
        assert_eq!(
            stats,
            RegistryStats {
                name: "test",
                active: 1,
                retiring: 0
            }
        );

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_serializes_concurrent_triggers() {
        let rotation = Rotation::Lazy {
            period: secs(600.0),
        };
        let registry = Arc::new(WindowedLimiterRegistry::new("concurrent", rotation).unwrap());
        let now = Instant::now();
        let limit = limit(100, 60.0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| registry.trigger("hot", limit, now))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }

    #[test]
    fn test_spawn_scheduled_rotation_is_noop_for_lazy() {
        let rotation = Rotation::Lazy { period: secs(1.0) };
        let registry = Arc::new(WindowedLimiterRegistry::<u64>::new("lazy", rotation).unwrap());
        assert!(registry.spawn_scheduled_rotation().unwrap().is_none());
    }

    #[test]
    fn test_scheduled_rotation_outside_runtime_is_an_error() {
        let rotation = Rotation::Scheduled {
            interval: secs(1.0),
        };
        let registry =
            Arc::new(WindowedLimiterRegistry::<u64>::new("scheduled", rotation).unwrap());

        let result = registry.spawn_scheduled_rotation();
        assert!(matches!(result, Err(StarguardError::Runtime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_rotation_evicts_idle_keys() {
        let interval = Duration::from_secs(20);
        let rotation = Rotation::Scheduled { interval };
        let registry = Arc::new(WindowedLimiterRegistry::new("scheduled", rotation).unwrap());
        let handle = registry.spawn_scheduled_rotation().unwrap().unwrap();

        assert!(registry.trigger(7u64, limit(1, 10.0), Instant::now()));

        tokio::time::sleep(interval + Duration::from_millis(1)).await;
        assert_eq!(registry.retiring_len(), 1);
        assert_eq!(registry.active_len(), 0);
        assert!(registry.contains(&7u64));

        tokio::time::sleep(interval).await;
        assert!(!registry.contains(&7u64));

        drop(registry);
        tokio::time::sleep(interval * 2).await;
        assert!(handle.is_finished());
    }
}
