//! Sharded wrappers: one global budget split across N independent buckets.
//!
//! Splitting a hot key into shards lifts throughput linearly and spreads the
//! shards across cluster slots, while each admission still runs atomically
//! against exactly one shard. Route by something with spread, e.g. a user
//! id, IP or tenant id.

use std::hash::Hasher;

use async_trait::async_trait;
use fnv::FnvHasher;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::leaky_bucket::{LeakyBucketLimiter, LeakyBucketOption};
use crate::limiter::{LimiterState, ShardedRateLimiter};
use crate::redis::RedisPool;
use crate::sliding_window::{SlidingWindowLimiter, SlidingWindowOption};
use crate::token_bucket::{TokenBucketLimiter, TokenBucketOption};

/// Shard count used when the caller passes zero.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// FNV-1a over the shard key bytes: stable across processes and restarts,
/// cheap, and evenly spread.
fn pick(shard_key: &str, count: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(shard_key.as_bytes());
    (hasher.finish() % count as u64) as usize
}

fn shard_count_or_default(shard_count: usize) -> usize {
    if shard_count == 0 {
        DEFAULT_SHARD_COUNT
    } else {
        shard_count
    }
}

/// A sharded token bucket: `shard_count` independent token buckets, each
/// owning `1/shard_count` of the global rate and capacity.
///
/// With `shard_count = 1` it behaves exactly like a single
/// [`TokenBucketLimiter`] with the same configuration.
pub struct ShardedTokenBucketLimiter {
    pub(crate) shards: Vec<TokenBucketLimiter>,
    count: usize,
}

impl ShardedTokenBucketLimiter {
    /// Creates a sharded token bucket for the global `key`.
    ///
    /// Each shard `i` uses the business key `"<key>:shard:<i>"` and the
    /// caller's options with rate and capacity divided by the shard count
    /// afterwards. A quotient that collapses to zero is floored at 1 so
    /// every shard keeps making progress, at the price of exact global
    /// accounting. The caller's option slice is never mutated.
    ///
    /// # Panics
    ///
    /// Panics when `key` is empty.
    pub fn new(
        pool: RedisPool,
        key: impl Into<String>,
        shard_count: usize,
        opts: &[TokenBucketOption],
    ) -> Self {
        let key = key.into();
        if key.is_empty() {
            panic!("sharded token bucket: key is empty");
        }
        let count = shard_count_or_default(shard_count);

        let mut shards = Vec::with_capacity(count);
        for i in 0..count {
            let shard_key = format!("{key}:shard:{i}");

            let mut inner_opts = opts.to_vec();
            inner_opts.push(TokenBucketOption::custom(move |tb| {
                tb.rate /= count as f64;
                if tb.rate <= 0.0 {
                    tb.rate = 1.0;
                }
                tb.capacity /= count as f64;
                if tb.capacity <= 0.0 {
                    tb.capacity = 1.0;
                }
            }));

            shards.push(TokenBucketLimiter::new(pool.clone(), shard_key, &inner_opts));
        }

        ShardedTokenBucketLimiter { shards, count }
    }

    fn shard(&self, shard_key: &str) -> &TokenBucketLimiter {
        &self.shards[pick(shard_key, self.count)]
    }

    /// Attempts to take one token from the shard `shard_key` routes to.
    pub async fn allow(&self, shard_key: &str) -> Result<bool> {
        self.shard(shard_key).allow().await
    }

    /// Attempts to take `n` tokens from the shard `shard_key` routes to.
    pub async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool> {
        self.shard(shard_key).allow_n(n).await
    }

    /// Blocks until the routed shard grants a token.
    pub async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()> {
        self.shard(shard_key).wait(cancel, max_wait).await
    }

    /// State of the routed shard, not a global aggregate.
    pub async fn state(&self, shard_key: &str) -> Result<LimiterState> {
        self.shard(shard_key).state().await
    }
}

#[async_trait]
impl ShardedRateLimiter for ShardedTokenBucketLimiter {
    async fn allow(&self, shard_key: &str) -> Result<bool> {
        ShardedTokenBucketLimiter::allow(self, shard_key).await
    }

    async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool> {
        ShardedTokenBucketLimiter::allow_n(self, shard_key, n).await
    }

    async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()> {
        ShardedTokenBucketLimiter::wait(self, shard_key, cancel, max_wait).await
    }

    async fn state(&self, shard_key: &str) -> Result<LimiterState> {
        ShardedTokenBucketLimiter::state(self, shard_key).await
    }
}

/// A sharded sliding window: the global `limit` is divided evenly across
/// `shard_count` independent windows.
pub struct ShardedSlidingWindowLimiter {
    shards: Vec<SlidingWindowLimiter>,
    count: usize,
}

impl ShardedSlidingWindowLimiter {
    /// Creates a sharded sliding window for the global `key`.
    ///
    /// The per-shard limit is the integer quotient `limit / shard_count`,
    /// floored at 1 when it would reach zero. The caller's option slice is
    /// never mutated.
    ///
    /// # Panics
    ///
    /// Panics when `key` is empty.
    pub fn new(
        pool: RedisPool,
        key: impl Into<String>,
        shard_count: usize,
        opts: &[SlidingWindowOption],
    ) -> Self {
        let key = key.into();
        if key.is_empty() {
            panic!("sharded sliding window: key is empty");
        }
        let count = shard_count_or_default(shard_count);

        let mut shards = Vec::with_capacity(count);
        for i in 0..count {
            let shard_key = format!("{key}:shard:{i}");

            let mut inner_opts = opts.to_vec();
            inner_opts.push(SlidingWindowOption::custom(move |l| {
                l.limit /= count as i64;
                if l.limit <= 0 {
                    l.limit = 1;
                }
            }));

            shards.push(SlidingWindowLimiter::new(pool.clone(), shard_key, &inner_opts));
        }

        ShardedSlidingWindowLimiter { shards, count }
    }

    fn shard(&self, shard_key: &str) -> &SlidingWindowLimiter {
        &self.shards[pick(shard_key, self.count)]
    }

    /// Attempts one admission on the shard `shard_key` routes to.
    pub async fn allow(&self, shard_key: &str) -> Result<bool> {
        self.shard(shard_key).allow().await
    }

    /// Attempts `n` admissions; only `n = 1` is supported.
    pub async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool> {
        self.shard(shard_key).allow_n(n).await
    }

    /// Blocks until the routed shard's window has room.
    pub async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()> {
        self.shard(shard_key).wait(cancel, max_wait).await
    }

    /// State of the routed shard, not a global aggregate.
    pub async fn state(&self, shard_key: &str) -> Result<LimiterState> {
        self.shard(shard_key).state().await
    }
}

#[async_trait]
impl ShardedRateLimiter for ShardedSlidingWindowLimiter {
    async fn allow(&self, shard_key: &str) -> Result<bool> {
        ShardedSlidingWindowLimiter::allow(self, shard_key).await
    }

    async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool> {
        ShardedSlidingWindowLimiter::allow_n(self, shard_key, n).await
    }

    async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()> {
        ShardedSlidingWindowLimiter::wait(self, shard_key, cancel, max_wait).await
    }

    async fn state(&self, shard_key: &str) -> Result<LimiterState> {
        ShardedSlidingWindowLimiter::state(self, shard_key).await
    }
}

/// A sharded leaky bucket: global leak rate and capacity divided evenly
/// across `shard_count` independent buckets.
pub struct ShardedLeakyBucketLimiter {
    shards: Vec<LeakyBucketLimiter>,
    count: usize,
}

impl ShardedLeakyBucketLimiter {
    /// Creates a sharded leaky bucket for the global `key`.
    ///
    /// Leak rate and capacity are divided by the shard count, floored at 1
    /// when the quotient collapses to zero. The caller's option slice is
    /// never mutated.
    ///
    /// # Panics
    ///
    /// Panics when `key` is empty.
    pub fn new(
        pool: RedisPool,
        key: impl Into<String>,
        shard_count: usize,
        opts: &[LeakyBucketOption],
    ) -> Self {
        let key = key.into();
        if key.is_empty() {
            panic!("sharded leaky bucket: key is empty");
        }
        let count = shard_count_or_default(shard_count);

        let mut shards = Vec::with_capacity(count);
        for i in 0..count {
            let shard_key = format!("{key}:shard:{i}");

            let mut inner_opts = opts.to_vec();
            inner_opts.push(LeakyBucketOption::custom(move |l| {
                l.leak_rate /= count as f64;
                if l.leak_rate <= 0.0 {
                    l.leak_rate = 1.0;
                }
                l.capacity /= count as f64;
                if l.capacity <= 0.0 {
                    l.capacity = 1.0;
                }
            }));

            shards.push(LeakyBucketLimiter::new(pool.clone(), shard_key, &inner_opts));
        }

        ShardedLeakyBucketLimiter { shards, count }
    }

    fn shard(&self, shard_key: &str) -> &LeakyBucketLimiter {
        &self.shards[pick(shard_key, self.count)]
    }

    /// Attempts to pour one unit into the shard `shard_key` routes to.
    pub async fn allow(&self, shard_key: &str) -> Result<bool> {
        self.shard(shard_key).allow().await
    }

    /// Attempts to pour `n` units into the routed shard.
    pub async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool> {
        self.shard(shard_key).allow_n(n).await
    }

    /// Blocks until the routed shard has room.
    pub async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()> {
        self.shard(shard_key).wait(cancel, max_wait).await
    }

    /// State of the routed shard, not a global aggregate.
    pub async fn state(&self, shard_key: &str) -> Result<LimiterState> {
        self.shard(shard_key).state().await
    }
}

#[async_trait]
impl ShardedRateLimiter for ShardedLeakyBucketLimiter {
    async fn allow(&self, shard_key: &str) -> Result<bool> {
        ShardedLeakyBucketLimiter::allow(self, shard_key).await
    }

    async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool> {
        ShardedLeakyBucketLimiter::allow_n(self, shard_key, n).await
    }

    async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()> {
        ShardedLeakyBucketLimiter::wait(self, shard_key, cancel, max_wait).await
    }

    async fn state(&self, shard_key: &str) -> Result<LimiterState> {
        ShardedLeakyBucketLimiter::state(self, shard_key).await
    }
}
