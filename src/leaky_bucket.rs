//! Leaky bucket: strict traffic shaping at `leak_rate` units per second.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LimiterError, Result};
use crate::limiter::{
    admission_verdict, unix_ms, wait_for_admission, LimiterState, RateLimiter,
};
use crate::redis::{self, RedisPool};
use crate::scripts::LEAKY_BUCKET_SCRIPT;

/// A single-bucket distributed leaky bucket.
///
/// Admissions pour water into the bucket; the bucket drains continuously at
/// `leak_rate`. Compared to the token bucket it is indifferent to bursts,
/// which makes it the smoother choice for strict output pacing.
pub struct LeakyBucketLimiter {
    pool: RedisPool,

    /// Business key, e.g. `"api:/v1/login"` or `"user:123"`.
    pub key: String,
    /// Redis key prefix, default `"lb"`.
    pub prefix: String,
    /// Drain rate in units per second.
    pub leak_rate: f64,
    /// Maximum water level, i.e. the most that can be queued up.
    pub capacity: f64,
    /// Expiry of the Redis keys.
    pub ttl: Duration,
}

/// Configuration option for [`LeakyBucketLimiter`].
#[derive(Clone)]
pub struct LeakyBucketOption(Arc<dyn Fn(&mut LeakyBucketLimiter) + Send + Sync>);

impl LeakyBucketOption {
    /// Sets the drain rate (units/sec).
    ///
    /// # Panics
    ///
    /// Panics when `leak_rate <= 0`.
    pub fn leak_rate(leak_rate: f64) -> Self {
        assert!(leak_rate > 0.0, "leaky bucket: leak rate must be > 0");
        LeakyBucketOption(Arc::new(move |l| l.leak_rate = leak_rate))
    }

    /// Sets the bucket capacity.
    ///
    /// # Panics
    ///
    /// Panics when `capacity <= 0`.
    pub fn capacity(capacity: f64) -> Self {
        assert!(capacity > 0.0, "leaky bucket: capacity must be > 0");
        LeakyBucketOption(Arc::new(move |l| l.capacity = capacity))
    }

    /// Sets the TTL of the Redis keys. A zero duration is ignored.
    pub fn ttl(ttl: Duration) -> Self {
        LeakyBucketOption(Arc::new(move |l| {
            if !ttl.is_zero() {
                l.ttl = ttl;
            }
        }))
    }

    /// Sets the Redis key prefix. An empty prefix is ignored.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        LeakyBucketOption(Arc::new(move |l| {
            if !prefix.is_empty() {
                l.prefix = prefix.clone();
            }
        }))
    }

    /// Applies `f` to the limiter after all prior options.
    pub fn custom(f: impl Fn(&mut LeakyBucketLimiter) + Send + Sync + 'static) -> Self {
        LeakyBucketOption(Arc::new(f))
    }

    pub(crate) fn apply(&self, l: &mut LeakyBucketLimiter) {
        (self.0)(l)
    }
}

impl LeakyBucketLimiter {
    /// Creates a leaky bucket limiter over `pool` for `key`.
    ///
    /// Defaults: leak rate 100 units/sec, capacity 100, TTL 2s, prefix
    /// `"lb"`.
    ///
    /// # Panics
    ///
    /// Panics when `key` is empty.
    pub fn new(pool: RedisPool, key: impl Into<String>, opts: &[LeakyBucketOption]) -> Self {
        let key = key.into();
        if key.is_empty() {
            panic!("leaky bucket: key is empty");
        }

        let mut l = LeakyBucketLimiter {
            pool,
            key,
            prefix: "lb".to_string(),
            leak_rate: 100.0,
            capacity: 100.0,
            ttl: Duration::from_secs(2),
        };

        for opt in opts {
            opt.apply(&mut l);
        }
        l
    }

    /// Redis key holding the water level.
    ///
    /// The `{key}` hash tag keeps both keys of one bucket in the same
    /// cluster slot.
    fn bucket_key(&self) -> String {
        format!("{}:{{{}}}:bucket", self.prefix, self.key)
    }

    /// Redis key holding the last drain timestamp.
    fn ts_key(&self) -> String {
        format!("{}:{{{}}}:ts", self.prefix, self.key)
    }

    /// Attempts to pour one unit into the bucket.
    pub async fn allow(&self) -> Result<bool> {
        self.allow_n(1).await
    }

    /// Attempts to pour `n` units in one atomic step.
    pub async fn allow_n(&self, n: i64) -> Result<bool> {
        if n <= 0 {
            return Err(LimiterError::InvalidRequest(
                "leaky bucket: n must be > 0".to_string(),
            ));
        }

        let now = unix_ms();
        let keys = [self.bucket_key(), self.ts_key()];
        let args = [
            now.to_string(),
            self.leak_rate.to_string(),
            self.capacity.to_string(),
            (n as f64).to_string(),
            (self.ttl.as_millis() as u64).to_string(),
        ];

        let value = redis::run_script(&self.pool, &LEAKY_BUCKET_SCRIPT, &keys, &args).await?;
        admission_verdict(value, "leaky bucket")
    }

    /// Blocks until the bucket has room, `max_wait` expires, or `cancel`
    /// fires.
    pub async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()> {
        wait_for_admission(cancel, max_wait, || self.allow()).await
    }

    /// Reads both keys and simulates the drain locally up to now, without
    /// mutating the store.
    ///
    /// A bucket with either key missing reads as the initial state: empty,
    /// available now.
    pub async fn state(&self) -> Result<LimiterState> {
        let level = redis::get_value(&self.pool, &self.bucket_key()).await?;
        let ts = match &level {
            Some(_) => redis::get_value(&self.pool, &self.ts_key()).await?,
            None => None,
        };

        let (Some(level), Some(ts)) = (level, ts) else {
            let now = unix_ms();
            return Ok(LimiterState {
                level: 0.0,
                remaining: self.capacity,
                capacity: self.capacity,
                rate: self.leak_rate,
                last_updated: now,
                next_available_time: now,
                kind: "leaky_bucket".to_string(),
                key: self.key.clone(),
            });
        };

        let level: f64 = level.parse().map_err(|e| {
            LimiterError::Protocol(format!("leaky bucket: invalid level value: {e}"))
        })?;
        let last_ts: u64 = ts.parse().map_err(|e| {
            LimiterError::Protocol(format!("leaky bucket: invalid ts value: {e}"))
        })?;

        let now = unix_ms();
        let delta_ms = now.saturating_sub(last_ts) as f64;

        // the same drain arithmetic the script runs, applied locally
        let mut real_level = level - (delta_ms * self.leak_rate) / 1000.0;
        if real_level < 0.0 {
            real_level = 0.0;
        }

        let mut remaining = self.capacity - real_level;
        if remaining < 0.0 {
            remaining = 0.0;
        }

        let next_available_time = if real_level < self.capacity {
            now
        } else {
            let wait_sec = (real_level - self.capacity) / self.leak_rate;
            now + (wait_sec * 1000.0) as u64
        };

        Ok(LimiterState {
            level: real_level,
            remaining,
            capacity: self.capacity,
            rate: self.leak_rate,
            last_updated: last_ts,
            next_available_time,
            kind: "leaky_bucket".to_string(),
            key: self.key.clone(),
        })
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        LeakyBucketLimiter::allow(self).await
    }

    async fn allow_n(&self, n: i64) -> Result<bool> {
        LeakyBucketLimiter::allow_n(self, n).await
    }

    async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()> {
        LeakyBucketLimiter::wait(self, cancel, max_wait).await
    }

    async fn state(&self) -> Result<LimiterState> {
        LeakyBucketLimiter::state(self).await
    }
}
