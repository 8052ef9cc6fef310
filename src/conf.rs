//! File-driven configuration and the rule-based limiter factory.

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use tokio::time::Duration;

use crate::limiter::{Limiter, NopLimiter, WrapperLimiter};
use crate::redis::RedisPool;
use crate::sharded::ShardedTokenBucketLimiter;
use crate::token_bucket::TokenBucketOption;

pub use crate::redis::Redis;

/// One rate-limiting rule: at most `count` admissions per `duration_ms` for
/// the named key, with `timeout_ms` as the wait budget before callers give
/// up.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitRule {
    pub enable: bool,
    pub key: String,
    pub count: u64,
    pub duration_ms: u64,
    pub timeout_ms: u64,
}

impl LimitRule {
    /// Builds this rule's limiter: a single-shard token bucket with rate
    /// `count / duration` and capacity `count`, bound to the rule's key and
    /// wait budget.
    pub(crate) fn build(&self, pool: &RedisPool) -> WrapperLimiter {
        let duration = Duration::from_millis(self.duration_ms);
        let rate = self.count as f64 / duration.as_secs_f64();
        let bucket = ShardedTokenBucketLimiter::new(
            pool.clone(),
            self.key.clone(),
            1,
            &[
                TokenBucketOption::rate(rate),
                TokenBucketOption::capacity(self.count as f64),
                TokenBucketOption::ttl(duration * 10),
            ],
        );

        WrapperLimiter::new(bucket, self.key.clone(), Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Conf {
    pub redis: Redis,

    #[serde(default)]
    pub rules: Vec<LimitRule>,
}

impl Conf {
    pub fn new() -> Result<Self, ConfigError> {
        let file_name =
            std::env::var("CONFIG_FILE_PATH").unwrap_or_else(|_| "./config/default.toml".into());
        Self::from(&file_name)
    }

    pub fn from(file_name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::new(file_name, FileFormat::Toml));
        builder.build()?.try_deserialize::<Conf>()
    }

    /// Builds a limiter for `key` from the first enabled matching rule.
    ///
    /// The rule becomes a single-shard token bucket with rate
    /// `count / duration` and capacity `count`, bound to `key` with the
    /// rule's timeout. Keys without an enabled, well-formed rule get a
    /// [`NopLimiter`].
    pub fn create(&self, key: &str, pool: &RedisPool) -> Box<dyn Limiter> {
        for rule in &self.rules {
            if rule.key != key || !rule.enable {
                continue;
            }
            if rule.count == 0 || rule.duration_ms == 0 {
                log::warn!(
                    "limiter rule for {} has a zero count or duration, skipping",
                    rule.key
                );
                continue;
            }

            return Box::new(rule.build(pool));
        }

        Box::new(NopLimiter::new())
    }
}
