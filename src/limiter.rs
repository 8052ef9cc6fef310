//! Capability surfaces and behavior shared by every limiter.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rustis::resp::Value;
use serde::Serialize;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{LimiterError, Result};
use crate::sharded::ShardedTokenBucketLimiter;

/// Unified surface of the single-key limiters.
///
/// `allow` returning `Ok(false)` means "denied, store healthy"; an `Err`
/// means the backend failed and the caller decides whether to fail open or
/// closed.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempts to take one permit.
    async fn allow(&self) -> Result<bool>;

    /// Attempts to take `n` permits in one atomic step, or none at all.
    async fn allow_n(&self, n: i64) -> Result<bool>;

    /// Blocks until a permit is granted, `max_wait` expires, or `cancel`
    /// fires.
    async fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> Result<()>;

    /// Snapshot of the limiter's state, without mutating the store.
    async fn state(&self) -> Result<LimiterState>;
}

/// Surface of the sharded limiters: the same four operations, routed by
/// `shard_key`.
///
/// Kept disjoint from [`RateLimiter`]; the sharded limiters compose single
/// limiters by ownership, one per shard.
#[async_trait]
pub trait ShardedRateLimiter: Send + Sync {
    async fn allow(&self, shard_key: &str) -> Result<bool>;

    async fn allow_n(&self, shard_key: &str, n: i64) -> Result<bool>;

    async fn wait(
        &self,
        shard_key: &str,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<()>;

    /// State of the shard `shard_key` routes to, not a global aggregate.
    async fn state(&self, shard_key: &str) -> Result<LimiterState>;
}

/// A snapshot of one limiter key, for monitoring and debugging.
///
/// Field meanings shift slightly with the algorithm:
/// level is available tokens (token bucket), admissions in the window
/// (sliding window) or the water level (leaky bucket); remaining is the
/// space left under the respective budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterState {
    pub level: f64,
    pub remaining: f64,
    pub capacity: f64,
    /// Recovery rate in units per second; for the sliding window this is
    /// `limit / window`.
    pub rate: f64,
    /// Unix milliseconds of the last store-side update.
    pub last_updated: u64,
    /// Earliest time (unix ms) a single-permit admission could succeed.
    pub next_available_time: u64,
    /// `"token_bucket"`, `"sliding_window"` or `"leaky_bucket"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
}

/// Minimal limiter capability for callers that only gate work.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Blocks until the caller may proceed.
    async fn wait(&self, cancel: &CancellationToken) -> Result<()>;

    /// Releases the permit, for implementations that track completion.
    async fn done(&self);
}

/// A limiter that admits everything; the "disabled" configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopLimiter;

impl NopLimiter {
    pub fn new() -> Self {
        NopLimiter
    }
}

#[async_trait]
impl Limiter for NopLimiter {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn done(&self) {}
}

/// Binds a sharded token bucket to a fixed shard key and wait budget so it
/// satisfies [`Limiter`].
pub struct WrapperLimiter {
    pub(crate) tb: ShardedTokenBucketLimiter,
    pub(crate) shard_key: String,
    pub(crate) max_wait: Duration,
}

impl WrapperLimiter {
    pub fn new(
        tb: ShardedTokenBucketLimiter,
        shard_key: impl Into<String>,
        max_wait: Duration,
    ) -> Self {
        WrapperLimiter {
            tb,
            shard_key: shard_key.into(),
            max_wait,
        }
    }
}

#[async_trait]
impl Limiter for WrapperLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        self.tb.wait(&self.shard_key, cancel, self.max_wait).await
    }

    async fn done(&self) {}
}

/// Current unix time in milliseconds.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}

/// Retry interval of the blocking wait loop, shared by all limiters.
pub(crate) const WAIT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `allow` until admitted, the deadline passes, or `cancel` fires.
///
/// `max_wait` of zero means "do not wait": the first denial returns
/// [`LimiterError::Limiter`] without sleeping. A deadline that has passed
/// returns [`LimiterError::Timeout`]; cancellation is observed at every
/// sleep boundary and returns [`LimiterError::Cancelled`]. Any `allow`
/// error aborts the loop.
pub(crate) async fn wait_for_admission<F, Fut>(
    cancel: &CancellationToken,
    max_wait: Duration,
    mut allow: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + max_wait;

    loop {
        if allow().await? {
            return Ok(());
        }
        if max_wait.is_zero() {
            return Err(LimiterError::Limiter);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(LimiterError::Timeout);
        }
        let pause = WAIT_RETRY_INTERVAL.min(deadline - now);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(LimiterError::Cancelled);
            }
            _ = sleep(pause) => {}
        }
    }
}

/// Decodes a script reply into an admission verdict.
///
/// The scripts only ever return the integers 0 and 1; any other reply shape
/// is a protocol violation and is reported with the raw value.
pub(crate) fn admission_verdict(value: Value, what: &str) -> Result<bool> {
    match value {
        Value::Integer(v) => Ok(v == 1),
        other => Err(LimiterError::Protocol(format!(
            "{what}: unexpected script result: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn wait_returns_once_admitted() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let rt = wait_for_admission(&cancel, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 2) }
        })
        .await;

        assert!(rt.is_ok());
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_with_zero_budget_fails_fast() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let rt = wait_for_admission(&cancel, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await;

        assert!(matches!(rt, Err(LimiterError::Limiter)));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_at_the_deadline() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let rt = wait_for_admission(&cancel, Duration::from_millis(25), || async { Ok(false) })
            .await;

        assert!(matches!(rt, Err(LimiterError::Timeout)));
        assert_eq!(Duration::from_millis(25), started.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation_not_timeout() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(35)).await;
            child.cancel();
        });

        let started = Instant::now();
        let rt = wait_for_admission(&cancel, Duration::from_secs(10), || async { Ok(false) })
            .await;

        assert!(matches!(rt, Err(LimiterError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wait_aborts_on_allow_error() {
        let cancel = CancellationToken::new();

        let rt = wait_for_admission(&cancel, Duration::from_secs(1), || async {
            Err(LimiterError::Protocol("boom".to_string()))
        })
        .await;

        assert!(matches!(rt, Err(LimiterError::Protocol(_))));
    }

    #[test]
    fn verdict_accepts_script_integers() {
        assert!(admission_verdict(Value::Integer(1), "token bucket").unwrap());
        assert!(!admission_verdict(Value::Integer(0), "token bucket").unwrap());
        // anything other than 1 is a denial, as with the Redis replies
        assert!(!admission_verdict(Value::Integer(2), "token bucket").unwrap());
    }

    #[test]
    fn verdict_rejects_other_shapes() {
        let err = admission_verdict(Value::SimpleString("OK".to_string()), "leaky bucket")
            .unwrap_err();
        assert!(matches!(err, LimiterError::Protocol(_)));
        assert!(err.to_string().contains("leaky bucket"));

        let err = admission_verdict(Value::Nil, "sliding window").unwrap_err();
        assert!(matches!(err, LimiterError::Protocol(_)));
    }

    #[test]
    fn state_serializes_with_wire_field_names() {
        let state = LimiterState {
            level: 1.0,
            remaining: 9.0,
            capacity: 10.0,
            rate: 5.0,
            last_updated: 1_700_000_000_000,
            next_available_time: 1_700_000_000_000,
            kind: "token_bucket".to_string(),
            key: "api:/v1/login".to_string(),
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!("token_bucket", json["type"]);
        assert_eq!("api:/v1/login", json["key"]);
        assert_eq!(10.0, json["capacity"]);
    }

    #[tokio::test]
    async fn nop_limiter_never_blocks() {
        let nop = NopLimiter::new();
        let cancel = CancellationToken::new();
        assert!(nop.wait(&cancel).await.is_ok());
        nop.done().await;

        // even a cancelled token admits
        cancel.cancel();
        assert!(nop.wait(&cancel).await.is_ok());
    }
}
