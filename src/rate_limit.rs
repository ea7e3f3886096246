//! Per-caller fixed-window rate limiting.
//!
//! Counters live in a [`RateLimitStore`] owned by the application state and
//! shared by every protected operation. Each key holds at most one
//! [`RateRecord`]; admission is an atomic read-modify-write on the map entry,
//! so two concurrent requests can never both take the last slot of a window.
//!
//! Windows are fixed, not sliding: a caller can spend a full quota just before
//! a window resets and another full quota just after. Expired records are
//! reclaimed by a lazy sweep that runs at most once per sweep interval.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

/// Default interval between two sweeps of expired records.
pub const DEFAULT_SWEEP_INTERVAL_MS: i64 = 60_000;

/// Quota for one protected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_duration_ms: i64,
}

impl RateLimitConfig {
    /// Streaming chat: 20 requests per minute.
    pub const CHAT: Self = Self::new(20, 60_000);
    /// Coupon redemption: 5 attempts per 15 minutes.
    pub const COUPON_APPLY: Self = Self::new(5, 15 * 60_000);
    /// Coupon lookups: 10 per minute.
    pub const COUPON_VALIDATE: Self = Self::new(10, 60_000);
    /// Checkout session creation: 5 per minute.
    pub const CHECKOUT: Self = Self::new(5, 60_000);

    pub const fn new(limit: u32, window_duration_ms: i64) -> Self {
        Self {
            limit,
            window_duration_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms.max(0) as u64)
    }
}

/// Counter state for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRecord {
    pub count: u32,
    /// Unix epoch milliseconds after which the window is over.
    pub window_reset_at: i64,
}

/// Outcome of a single [`RateLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix epoch milliseconds.
    pub window_reset_at: i64,
    pub limit: u32,
}

impl RateLimitDecision {
    /// Seconds the caller should wait before retrying, rounded up. Never
    /// reports less than one second for a rejected request.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let wait_ms = (self.window_reset_at - now_ms).max(0) as u64;
        wait_ms.div_ceil(1000).max(1)
    }

    /// Window reset as unix seconds, rounded up.
    pub fn reset_unix_secs(&self) -> i64 {
        self.window_reset_at.saturating_add(999).div_euclid(1000)
    }
}

/// Owned counter map plus sweep bookkeeping.
pub struct RateLimitStore {
    records: DashMap<String, RateRecord>,
    sweep_interval_ms: i64,
    last_sweep_ms: AtomicI64,
}

impl RateLimitStore {
    pub fn new(sweep_interval_ms: i64) -> Self {
        Self {
            records: DashMap::new(),
            sweep_interval_ms: sweep_interval_ms.max(1),
            last_sweep_ms: AtomicI64::new(0),
        }
    }

    /// Number of keys currently tracked, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<RateRecord> {
        self.records.get(key).map(|r| *r)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms as u64)
    }

    /// Runs a sweep if the interval has elapsed since the last one. Only one
    /// caller wins the race for a given interval.
    fn maybe_sweep(&self, now_ms: i64) -> usize {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms - last < self.sweep_interval_ms {
            return 0;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }
        self.sweep(now_ms)
    }

    /// Removes every record whose window is over. Works shard by shard, so
    /// concurrent checks on other shards are never blocked.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| now_ms <= record.window_reset_at);
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            tracing::debug!(purged, remaining = self.records.len(), "swept expired rate-limit records");
        }
        purged
    }
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL_MS)
    }
}

/// Fixed-window limiter over a shared [`RateLimitStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }

    /// Check and record one request for `key` at the current wall-clock time.
    pub fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.check_at(key, config, now_ms())
    }

    /// Check and record one request for `key` at `now_ms` (unix epoch ms).
    pub fn check_at(&self, key: &str, config: &RateLimitConfig, now_ms: i64) -> RateLimitDecision {
        // Sweep before taking the entry lock: retain locks every shard.
        self.store.maybe_sweep(now_ms);

        let mut entry = self
            .store
            .records
            .entry(key.to_string())
            .or_insert(RateRecord {
                count: 0,
                window_reset_at: i64::MIN,
            });
        let record = entry.value_mut();

        if record.count == 0 || now_ms > record.window_reset_at {
            *record = RateRecord {
                count: 1,
                window_reset_at: now_ms.saturating_add(config.window_duration_ms),
            };
            return RateLimitDecision {
                allowed: true,
                remaining: config.limit.saturating_sub(1),
                window_reset_at: record.window_reset_at,
                limit: config.limit,
            };
        }

        if record.count >= config.limit {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                window_reset_at: record.window_reset_at,
                limit: config.limit,
            };
        }

        record.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: config.limit - record.count,
            window_reset_at: record.window_reset_at,
            limit: config.limit,
        }
    }
}

/// Current wall-clock time in unix epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
