//! Token bucket: bursts up to `capacity`, sustained throughput of `rate`
//! tokens per second.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LimiterError, Result};
use crate::limiter::{
    admission_verdict, unix_ms, wait_for_admission, LimiterState, RateLimiter,
};
use crate::redis::{self, RedisPool};
use crate::scripts::TOKEN_BUCKET_SCRIPT;

/// A single-bucket distributed token bucket.
///
/// Tokens refill continuously at `rate` per second up to `capacity`; a full
/// bucket admits a burst of `capacity` requests at once. Good for API QPS
/// limits and task consumption pacing.
///
/// Configuration is immutable after construction; every admission executes
/// atomically on the Redis server, so instances are freely shared across
/// tasks.
pub struct TokenBucketLimiter {
    pool: RedisPool,

    /// Business key, e.g. `"api:/v1/login"` or `"user:123"`.
    pub key: String,
    /// Redis key prefix, default `"tbucket"`.
    pub prefix: String,
    /// Token refill rate in tokens per second.
    pub rate: f64,
    /// Maximum token count.
    pub capacity: f64,
    /// Expiry of the Redis keys; pick something above the typical idle gap.
    pub ttl: Duration,
}

/// Configuration option for [`TokenBucketLimiter`].
///
/// Options apply in order after the defaults; [`TokenBucketOption::custom`]
/// is the escape hatch for last-mile adjustments such as the per-shard
/// budget scaling of the sharded wrapper.
#[derive(Clone)]
pub struct TokenBucketOption(Arc<dyn Fn(&mut TokenBucketLimiter) + Send + Sync>);

impl TokenBucketOption {
    /// Sets the refill rate (tokens/sec).
    ///
    /// # Panics
    ///
    /// Panics when `rate <= 0`.
    pub fn rate(rate: f64) -> Self {
        assert!(rate > 0.0, "token bucket: rate must be > 0");
        TokenBucketOption(Arc::new(move |tb| tb.rate = rate))
    }

    /// Sets the bucket capacity.
    ///
    /// # Panics
    ///
    /// Panics when `capacity <= 0`.
    pub fn capacity(capacity: f64) -> Self {
        assert!(capacity > 0.0, "token bucket: capacity must be > 0");
        TokenBucketOption(Arc::new(move |tb| tb.capacity = capacity))
    }

    /// Sets the TTL of the Redis keys. A zero duration is ignored.
    pub fn ttl(ttl: Duration) -> Self {
        TokenBucketOption(Arc::new(move |tb| {
            if !ttl.is_zero() {
                tb.ttl = ttl;
            }
        }))
    }

    /// Sets the Redis key prefix. An empty prefix is ignored.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        TokenBucketOption(Arc::new(move |tb| {
            if !prefix.is_empty() {
                tb.prefix = prefix.clone();
            }
        }))
    }

    /// Applies `f` to the limiter after all prior options.
    pub fn custom(f: impl Fn(&mut TokenBucketLimiter) + Send + Sync + 'static) -> Self {
        TokenBucketOption(Arc::new(f))
    }

    pub(crate) fn apply(&self, tb: &mut TokenBucketLimiter) {
        (self.0)(tb)
    }
}

impl TokenBucketLimiter {
    /// Creates a token bucket limiter over `pool` for `key`.
    ///
    /// Defaults: rate 100 tokens/sec, capacity 100, TTL 2s, prefix
    /// `"tbucket"`.
    ///
    /// # Panics
    ///
    /// Panics when `key` is empty.
    pub fn new(pool: RedisPool, key: impl Into<String>, opts: &[TokenBucketOption]) -> Self {
        let key = key.into();
        if key.is_empty() {
            panic!("token bucket: key is empty");
        }

        let mut tb = TokenBucketLimiter {
            pool,
            key,
            prefix: "tbucket".to_string(),
            rate: 100.0,
            capacity: 100.0,
            ttl: Duration::from_secs(2),
        };

        for opt in opts {
            opt.apply(&mut tb);
        }
        tb
    }

    /// Redis key holding the current token count.
    ///
    /// The `{key}` hash tag keeps both keys of one bucket in the same
    /// cluster slot.
    fn tokens_key(&self) -> String {
        format!("{}:{{{}}}:tokens", self.prefix, self.key)
    }

    /// Redis key holding the last refill timestamp.
    fn ts_key(&self) -> String {
        format!("{}:{{{}}}:ts", self.prefix, self.key)
    }

    /// Attempts to take one token.
    pub async fn allow(&self) -> Result<bool> {
        self.allow_n(1).await
    }

    /// Attempts to take `n` tokens in one atomic step.
    pub async fn allow_n(&self, n: i64) -> Result<bool> {
        if n <= 0 {
            return Err(LimiterError::InvalidRequest(
                "token bucket: n must be > 0".to_string(),
            ));
        }

        let now = unix_ms();
        let keys = [self.tokens_key(), self.ts_key()];
        let args = [
            now.to_string(),
            self.rate.to_string(),
            self.capacity.to_string(),
            (n as f64).to_string(),
            (self.ttl.as_millis() as u64).to_string(),
        ];

        let value = redis::run_script(&self.pool, &TOKEN_BUCKET_SCRIPT, &keys, &args).await?;
        admission_verdict(value, "token bucket")
    }

    /// Blocks until one token is taken, `max_wait` expires, or `cancel`
    /// fires.
    pub async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()> {
        wait_for_admission(cancel, max_wait, || self.allow()).await
    }

    /// Reads both keys and simulates the refill locally up to now, without
    /// mutating the store.
    ///
    /// An untouched bucket (no tokens key) reads as full as of now. A tokens
    /// key without its companion timestamp is reported as
    /// [`LimiterError::MissingState`].
    pub async fn state(&self) -> Result<LimiterState> {
        let Some(tokens) = redis::get_value(&self.pool, &self.tokens_key()).await? else {
            let now = unix_ms();
            return Ok(LimiterState {
                level: self.capacity,
                remaining: self.capacity,
                capacity: self.capacity,
                rate: self.rate,
                last_updated: now,
                next_available_time: now,
                kind: "token_bucket".to_string(),
                key: self.key.clone(),
            });
        };

        let Some(ts) = redis::get_value(&self.pool, &self.ts_key()).await? else {
            return Err(LimiterError::MissingState(self.ts_key()));
        };

        let tokens: f64 = tokens.parse().map_err(|e| {
            LimiterError::Protocol(format!("token bucket: invalid tokens: {e}"))
        })?;
        let last_ts: u64 = ts
            .parse()
            .map_err(|e| LimiterError::Protocol(format!("token bucket: invalid ts: {e}")))?;

        let now = unix_ms();
        let delta_ms = now.saturating_sub(last_ts) as f64;

        // the same refill arithmetic the script runs, applied locally
        let mut level = tokens + (delta_ms * self.rate) / 1000.0;
        if level > self.capacity {
            level = self.capacity;
        }
        if level < 0.0 {
            level = 0.0;
        }

        let next_available_time = if level >= 1.0 {
            now
        } else {
            let wait_sec = (1.0 - level) / self.rate;
            now + (wait_sec * 1000.0) as u64
        };

        Ok(LimiterState {
            level,
            remaining: level,
            capacity: self.capacity,
            rate: self.rate,
            last_updated: last_ts,
            next_available_time,
            kind: "token_bucket".to_string(),
            key: self.key.clone(),
        })
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        TokenBucketLimiter::allow(self).await
    }

    async fn allow_n(&self, n: i64) -> Result<bool> {
        TokenBucketLimiter::allow_n(self, n).await
    }

    async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()> {
        TokenBucketLimiter::wait(self, cancel, max_wait).await
    }

    async fn state(&self) -> Result<LimiterState> {
        TokenBucketLimiter::state(self).await
    }
}
