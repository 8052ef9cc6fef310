//! Distributed rate limiting on Redis.
//!
//! Three algorithmically distinct limiters — token bucket, sliding window
//! log and leaky bucket — each executed as one atomic Lua script on the
//! server, plus a sharded variant of each that splits a global budget across
//! N independent sub-buckets to avoid single-key hotspots. Hash-tagged key
//! names keep every key one script touches in the same cluster slot, while
//! distinct shards scatter across slots.
//!
//! All limiting state lives in Redis under millisecond TTLs; limiter
//! instances are immutable after construction and freely shared across
//! tasks without any client-side locking.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use shardlimit::{redis, TokenBucketLimiter, TokenBucketOption};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = redis::new(redis::Redis {
//!         host: "127.0.0.1".to_string(),
//!         port: 6379,
//!         username: String::new(),
//!         password: String::new(),
//!     })
//!     .await?;
//!
//!     let limiter = TokenBucketLimiter::new(
//!         pool,
//!         "api:/v1/login",
//!         &[
//!             TokenBucketOption::rate(100.0),
//!             TokenBucketOption::capacity(200.0),
//!             TokenBucketOption::ttl(Duration::from_secs(2)),
//!         ],
//!     );
//!
//!     if limiter.allow().await? {
//!         // handle the request
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Sharding
//!
//! ```no_run
//! use shardlimit::{redis, ShardedTokenBucketLimiter, TokenBucketOption};
//!
//! # async fn demo(pool: shardlimit::redis::RedisPool) -> shardlimit::Result<()> {
//! // 4 shards, 10 tokens/sec and capacity 10 each
//! let limiter = ShardedTokenBucketLimiter::new(
//!     pool,
//!     "api:/v1/chat",
//!     4,
//!     &[
//!         TokenBucketOption::rate(40.0),
//!         TokenBucketOption::capacity(40.0),
//!     ],
//! );
//!
//! // equal shard keys always land on the same shard
//! let admitted = limiter.allow("user:7").await?;
//! # let _ = admitted;
//! # Ok(())
//! # }
//! ```

pub mod conf;
mod error;
mod leaky_bucket;
mod limiter;
pub mod redis;
mod scripts;
mod sharded;
mod sliding_window;
mod token_bucket;

pub use error::{LimiterError, Result};
pub use leaky_bucket::{LeakyBucketLimiter, LeakyBucketOption};
pub use limiter::{
    Limiter, LimiterState, NopLimiter, RateLimiter, ShardedRateLimiter, WrapperLimiter,
};
pub use scripts::{
    leaky_bucket_script_hash, sliding_window_script_hash, token_bucket_script_hash,
    LEAKY_BUCKET, SLIDING_WINDOW, TOKEN_BUCKET,
};
pub use sharded::{
    ShardedLeakyBucketLimiter, ShardedSlidingWindowLimiter, ShardedTokenBucketLimiter,
    DEFAULT_SHARD_COUNT,
};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowOption};
pub use token_bucket::{TokenBucketLimiter, TokenBucketOption};
