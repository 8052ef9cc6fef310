//! Sliding window log: at most `limit` admissions in any rolling `window`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LimiterError, Result};
use crate::limiter::{
    admission_verdict, unix_ms, wait_for_admission, LimiterState, RateLimiter,
};
use crate::redis::{self, RedisPool};
use crate::scripts::SLIDING_WINDOW_SCRIPT;

/// A single-key sliding window log limiter.
///
/// Admission timestamps live in a ZSET, so the window truly slides instead
/// of resetting at fixed boundaries. Suited to "at most N calls in the last
/// M seconds" rules: SMS codes, login failures, verification attempts.
pub struct SlidingWindowLimiter {
    pool: RedisPool,

    /// Business key.
    pub key: String,
    /// Redis key prefix, default `"sw"`.
    pub prefix: String,
    /// Window size, e.g. one minute.
    pub window: Duration,
    /// Maximum admissions inside the window.
    pub limit: i64,
    /// Expiry of the Redis keys; keep it at or above twice the window.
    pub ttl: Duration,
}

/// Configuration option for [`SlidingWindowLimiter`].
#[derive(Clone)]
pub struct SlidingWindowOption(Arc<dyn Fn(&mut SlidingWindowLimiter) + Send + Sync>);

impl SlidingWindowOption {
    /// Sets the window size. A zero duration is ignored.
    pub fn window(window: Duration) -> Self {
        SlidingWindowOption(Arc::new(move |l| {
            if !window.is_zero() {
                l.window = window;
            }
        }))
    }

    /// Sets the admission limit per window.
    ///
    /// # Panics
    ///
    /// Panics when `limit <= 0`.
    pub fn limit(limit: i64) -> Self {
        assert!(limit > 0, "sliding window: limit must be > 0");
        SlidingWindowOption(Arc::new(move |l| l.limit = limit))
    }

    /// Sets the TTL of the Redis keys. A zero duration is ignored.
    pub fn ttl(ttl: Duration) -> Self {
        SlidingWindowOption(Arc::new(move |l| {
            if !ttl.is_zero() {
                l.ttl = ttl;
            }
        }))
    }

    /// Sets the Redis key prefix. An empty prefix is ignored.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        SlidingWindowOption(Arc::new(move |l| {
            if !prefix.is_empty() {
                l.prefix = prefix.clone();
            }
        }))
    }

    /// Applies `f` to the limiter after all prior options.
    pub fn custom(f: impl Fn(&mut SlidingWindowLimiter) + Send + Sync + 'static) -> Self {
        SlidingWindowOption(Arc::new(f))
    }

    pub(crate) fn apply(&self, l: &mut SlidingWindowLimiter) {
        (self.0)(l)
    }
}

impl SlidingWindowLimiter {
    /// Creates a sliding window limiter over `pool` for `key`.
    ///
    /// Defaults: window 1 minute, limit 60, TTL 2 minutes, prefix `"sw"`.
    ///
    /// # Panics
    ///
    /// Panics when `key` is empty.
    pub fn new(pool: RedisPool, key: impl Into<String>, opts: &[SlidingWindowOption]) -> Self {
        let key = key.into();
        if key.is_empty() {
            panic!("sliding window: key is empty");
        }

        let mut l = SlidingWindowLimiter {
            pool,
            key,
            prefix: "sw".to_string(),
            window: Duration::from_secs(60),
            limit: 60,
            ttl: Duration::from_secs(120),
        };

        for opt in opts {
            opt.apply(&mut l);
        }
        l
    }

    /// ZSET holding the admission timestamps.
    fn log_key(&self) -> String {
        format!("{}:{{{}}}:log", self.prefix, self.key)
    }

    /// Counter that keeps ZSET members unique within one millisecond.
    fn seq_key(&self) -> String {
        format!("{}:{{{}}}:seq", self.prefix, self.key)
    }

    /// Attempts to claim one slot in the window.
    pub async fn allow(&self) -> Result<bool> {
        self.allow_n(1).await
    }

    /// Attempts to claim `n` slots.
    ///
    /// Only `n = 1` is supported: the log records one member per admission,
    /// and batching members would need a different script. Any other `n` is
    /// reported as an error without touching the store.
    pub async fn allow_n(&self, n: i64) -> Result<bool> {
        if n != 1 {
            return Err(LimiterError::InvalidRequest(
                "sliding window: allow_n only supports n = 1".to_string(),
            ));
        }

        let now = unix_ms();
        let keys = [self.log_key(), self.seq_key()];
        let args = [
            now.to_string(),
            (self.window.as_millis() as u64).to_string(),
            self.limit.to_string(),
            (self.ttl.as_millis() as u64).to_string(),
        ];

        let value = redis::run_script(&self.pool, &SLIDING_WINDOW_SCRIPT, &keys, &args).await?;
        admission_verdict(value, "sliding window")
    }

    /// Blocks until a slot frees up, `max_wait` expires, or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()> {
        wait_for_admission(cancel, max_wait, || self.allow()).await
    }

    /// Counts the admissions currently inside the window, without mutating
    /// the store.
    ///
    /// `next_available_time` is reported as "now"; computing the true
    /// earliest slot would need the oldest log entry and is left to callers
    /// that poll.
    pub async fn state(&self) -> Result<LimiterState> {
        let now = unix_ms();
        let min_score = now.saturating_sub(self.window.as_millis() as u64);

        let card = redis::zcount_from(&self.pool, &self.log_key(), min_score).await?;

        let level = card as f64;
        let mut remaining = self.limit as f64 - level;
        if remaining < 0.0 {
            remaining = 0.0;
        }

        Ok(LimiterState {
            level,
            remaining,
            capacity: self.limit as f64,
            rate: self.limit as f64 / self.window.as_secs_f64(),
            last_updated: now,
            next_available_time: now,
            kind: "sliding_window".to_string(),
            key: self.key.clone(),
        })
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self) -> Result<bool> {
        SlidingWindowLimiter::allow(self).await
    }

    async fn allow_n(&self, n: i64) -> Result<bool> {
        SlidingWindowLimiter::allow_n(self, n).await
    }

    async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()> {
        SlidingWindowLimiter::wait(self, cancel, max_wait).await
    }

    async fn state(&self) -> Result<LimiterState> {
        SlidingWindowLimiter::state(self).await
    }
}
