//! Two-bucket sliding window counter.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StarguardError};

/// Capacity over a period, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    capacity: u32,
    period: Duration,
}

impl Limit {
    /// Create a limit of `capacity` events per `period`.
    ///
    /// Zero capacity or a zero period is refused here so that a bad value
    /// never reaches the window math.
    pub fn new(capacity: u32, period: Duration) -> Result<Self> {
        if capacity == 0 || period.is_zero() {
            return Err(StarguardError::InvalidLimit { capacity, period });
        }
        Ok(Self { capacity, period })
    }

    /// Create a limit from a period expressed in (fractional) seconds.
    pub fn from_secs_f64(capacity: u32, period_secs: f64) -> Result<Self> {
        let period = Duration::try_from_secs_f64(period_secs).map_err(|_| {
            StarguardError::Config(format!(
                "period must be a positive number of seconds, got {period_secs}"
            ))
        })?;
        Self::new(capacity, period)
    }

    /// Maximum events admitted per period.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Length of one bucket.
    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Serializable form of a [`Limit`], as it appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Events admitted per period
    pub capacity: u32,
    /// Period length in seconds
    pub period_secs: f64,
}

impl LimitConfig {
    /// Shorthand used by the configuration defaults.
    pub const fn new(capacity: u32, period_secs: f64) -> Self {
        Self { capacity, period_secs }
    }
}

impl TryFrom<LimitConfig> for Limit {
    type Error = StarguardError;

    fn try_from(config: LimitConfig) -> Result<Self> {
        Limit::from_secs_f64(config.capacity, config.period_secs)
    }
}

/// Approximate sliding window over two fixed buckets.
///
/// Events in the previous bucket are assumed to be spread evenly over it,
/// so the trailing-window estimate is
/// `previous * (period - elapsed) / period + current`, where `elapsed` is
/// the time since the current bucket started. Memory and time per check
/// are both O(1).
///
/// Consecutive buckets are exactly `period` apart. After two or more idle
/// periods the counter restarts at the next event. A fresh counter starts
/// cold, with both buckets empty.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    limit: Limit,
    window_start: Instant,
    previous_count: u64,
    current_count: u64,
}

/// Bucket state as seen at some instant, without mutating the counter.
#[derive(Debug, Clone, Copy)]
struct Buckets {
    window_start: Instant,
    previous: u64,
    current: u64,
}

impl SlidingWindowCounter {
    /// Create a counter whose first bucket starts at `now`.
    pub fn new(limit: Limit, now: Instant) -> Self {
        Self {
            limit,
            window_start: now,
            previous_count: 0,
            current_count: 0,
        }
    }

    /// Admit one event if the estimate is below capacity.
    ///
    /// A rejected call leaves the counts untouched.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.roll(now);

        if self.estimated(now) >= self.limit.capacity as f64 {
            return false;
        }

        self.current_count += 1;
        true
    }

    /// Estimated number of events in the trailing period ending at `now`.
    pub fn estimated(&self, now: Instant) -> f64 {
        let buckets = self.buckets_at(now);
        let period = self.limit.period.as_secs_f64();
        let elapsed = now.saturating_duration_since(buckets.window_start).as_secs_f64();
        let weight = ((period - elapsed) / period).max(0.0);

        buckets.previous as f64 * weight + buckets.current as f64
    }

    /// How long until an admission at `now` (or later) would succeed.
    ///
    /// Returns [`Duration::ZERO`] when an immediate [`try_acquire`] would
    /// admit.
    ///
    /// [`try_acquire`]: SlidingWindowCounter::try_acquire
    pub fn retry_after(&self, now: Instant) -> Duration {
        let capacity = self.limit.capacity as f64;
        if self.estimated(now) < capacity {
            return Duration::ZERO;
        }

        let buckets = self.buckets_at(now);
        let period = self.limit.period.as_secs_f64();
        let elapsed = now.saturating_duration_since(buckets.window_start).as_secs_f64();
        let remaining = (period - elapsed).max(0.0);

        // The current bucket alone fills the window: wait for it to become
        // the previous bucket, which then starts decaying immediately.
        if buckets.current as f64 >= capacity || buckets.previous == 0 {
            return Duration::from_secs_f64(remaining);
        }

        let headroom = capacity - buckets.current as f64;
        let wait = remaining - period * headroom / buckets.previous as f64;
        Duration::from_secs_f64(wait.max(0.0))
    }

    /// The limit this counter was created with.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// Events admitted in the current bucket.
    pub fn current_count(&self) -> u64 {
        self.current_count
    }

    /// Events admitted in the bucket immediately before the current one.
    pub fn previous_count(&self) -> u64 {
        self.previous_count
    }

    /// Start of the current bucket.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    fn roll(&mut self, now: Instant) {
        let buckets = self.buckets_at(now);
        self.window_start = buckets.window_start;
        self.previous_count = buckets.previous;
        self.current_count = buckets.current;
    }

    fn buckets_at(&self, now: Instant) -> Buckets {
        let period = self.limit.period;
        let elapsed = now.saturating_duration_since(self.window_start);

        if elapsed < period {
            return Buckets {
                window_start: self.window_start,
                previous: self.previous_count,
                current: self.current_count,
            };
        }

        // Nothing from two or more periods ago is still in the window, so
        // the counter starts over exactly like a freshly created one.
        if elapsed >= period * 2 {
            return Buckets {
                window_start: now,
                previous: 0,
                current: 0,
            };
        }

        Buckets {
            window_start: self.window_start + period,
            previous: self.current_count,
            current: 0,
        }
    }
}
