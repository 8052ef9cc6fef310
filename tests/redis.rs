//! End-to-end behavior against a real store.
//!
//! These tests exercise the Lua scripts and the client orchestration
//! together and therefore need a running Redis at 127.0.0.1:6379; they are
//! ignored by default. Run them with:
//!
//! ```sh
//! cargo test --test redis -- --ignored
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use shardlimit::conf::{Conf, LimitRule};
use shardlimit::{
    redis, LeakyBucketLimiter, LeakyBucketOption, LimiterError, ShardedTokenBucketLimiter,
    SlidingWindowLimiter, SlidingWindowOption, TokenBucketLimiter, TokenBucketOption,
};

const REDIS_REQUIRED: &str = "requires a running Redis at 127.0.0.1:6379";

async fn pool() -> redis::RedisPool {
    redis::new(redis::Redis {
        host: "127.0.0.1".to_string(),
        port: 6379,
        username: String::new(),
        password: String::new(),
    })
    .await
    .expect(REDIS_REQUIRED)
}

/// Business key that no other test run has touched.
fn unique_key(name: &str) -> String {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_nanos();
    format!("itest:{name}:{ns}")
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn token_bucket_burst_then_throttle() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("burst"),
        &[
            TokenBucketOption::rate(10.0),
            TokenBucketOption::capacity(10.0),
            TokenBucketOption::ttl(Duration::from_secs(2)),
        ],
    );

    for i in 0..10 {
        assert!(tb.allow().await?, "admission {i} should pass the burst");
    }
    assert!(!tb.allow().await?, "the 11th admission is denied");

    // one token refills after 100ms at 10 tokens/sec
    sleep(Duration::from_millis(150)).await;
    assert!(tb.allow().await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn token_bucket_allow_n_is_all_or_nothing() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("batch"),
        &[
            TokenBucketOption::rate(0.1),
            TokenBucketOption::capacity(10.0),
            TokenBucketOption::ttl(Duration::from_secs(10)),
        ],
    );

    assert!(tb.allow_n(10).await?, "a full bucket grants the whole batch");
    assert!(!tb.allow_n(1).await?, "nothing is left afterwards");
    assert!(
        !tb.allow_n(10).await?,
        "an oversized batch is denied in full"
    );

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn token_bucket_state_tracks_admissions() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("state"),
        &[
            TokenBucketOption::rate(10.0),
            TokenBucketOption::capacity(10.0),
            TokenBucketOption::ttl(Duration::from_secs(5)),
        ],
    );

    for _ in 0..3 {
        assert!(tb.allow().await?);
    }

    let state = tb.state().await?;
    assert_eq!("token_bucket", state.kind);
    assert_eq!(10.0, state.capacity);
    assert_eq!(10.0, state.rate);
    // 3 tokens spent, plus whatever refilled while the test ran
    assert!(state.level >= 7.0 && state.level < 8.0, "level {}", state.level);
    assert_eq!(state.level, state.remaining);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn state_on_a_fresh_key_reads_as_full() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("fresh"),
        &[
            TokenBucketOption::rate(10.0),
            TokenBucketOption::capacity(10.0),
        ],
    );

    let before = SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_millis() as u64;
    let state = tb.state().await?;

    assert_eq!(10.0, state.level);
    assert_eq!(10.0, state.remaining);
    assert_eq!("token_bucket", state.kind);
    assert!(state.next_available_time >= before);
    assert!(state.next_available_time < before + 1000);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn sliding_window_saturates_then_slides() -> anyhow::Result<()> {
    let sw = SlidingWindowLimiter::new(
        pool().await,
        unique_key("window"),
        &[
            SlidingWindowOption::window(Duration::from_secs(2)),
            SlidingWindowOption::limit(3),
            SlidingWindowOption::ttl(Duration::from_secs(4)),
        ],
    );

    for _ in 0..3 {
        assert!(sw.allow().await?);
    }
    assert!(!sw.allow().await?, "the window is full");

    let state = sw.state().await?;
    assert_eq!(3.0, state.level);
    assert_eq!(0.0, state.remaining);
    assert_eq!("sliding_window", state.kind);

    // the first admission ages out of the window
    sleep(Duration::from_millis(2100)).await;
    assert!(sw.allow().await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn sliding_window_disambiguates_same_millisecond() -> anyhow::Result<()> {
    let sw = SlidingWindowLimiter::new(
        pool().await,
        unique_key("samems"),
        &[
            SlidingWindowOption::window(Duration::from_secs(10)),
            SlidingWindowOption::limit(5),
        ],
    );

    // back-to-back admissions land in the same millisecond; each still
    // occupies its own log entry
    for _ in 0..5 {
        assert!(sw.allow().await?);
    }
    assert!(!sw.allow().await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn leaky_bucket_overflows_then_drains() -> anyhow::Result<()> {
    let lb = LeakyBucketLimiter::new(
        pool().await,
        unique_key("leak"),
        &[
            LeakyBucketOption::leak_rate(2.0),
            LeakyBucketOption::capacity(2.0),
            LeakyBucketOption::ttl(Duration::from_secs(5)),
        ],
    );

    assert!(lb.allow().await?);
    assert!(lb.allow().await?);
    assert!(!lb.allow().await?, "the bucket is full");

    // one unit drains after 500ms at 2 units/sec
    sleep(Duration::from_millis(600)).await;
    assert!(lb.allow().await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn denied_admissions_leave_state_untouched() -> anyhow::Result<()> {
    let lb = LeakyBucketLimiter::new(
        pool().await,
        unique_key("denied"),
        &[
            LeakyBucketOption::leak_rate(0.1),
            LeakyBucketOption::capacity(2.0),
            LeakyBucketOption::ttl(Duration::from_secs(30)),
        ],
    );

    assert!(lb.allow().await?);
    assert!(lb.allow().await?);
    for _ in 0..5 {
        assert!(!lb.allow().await?);
    }

    // five denials poured nothing; only the slow leak moved the level
    let state = lb.state().await?;
    assert!(state.level > 1.8 && state.level <= 2.0, "level {}", state.level);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn sharded_routing_is_deterministic() -> anyhow::Result<()> {
    let sharded = ShardedTokenBucketLimiter::new(
        pool().await,
        unique_key("route"),
        4,
        &[
            TokenBucketOption::rate(40.0),
            TokenBucketOption::capacity(40.0),
            TokenBucketOption::ttl(Duration::from_secs(5)),
        ],
    );

    // every admission for one shard key hits the same 10-token shard
    let mut admitted = 0;
    for _ in 0..20 {
        if sharded.allow("user:7").await? {
            admitted += 1;
        }
    }
    assert!(
        (10..=11).contains(&admitted),
        "one shard's budget admits ~10, got {admitted}"
    );

    let state = sharded.state("user:7").await?;
    assert_eq!(10.0, state.capacity, "per-shard budget is global/4");

    // some other shard still has room after user:7's shard is exhausted
    let mut other_admitted = false;
    for i in 0..64 {
        if sharded.allow(&format!("user:{i}")).await? {
            other_admitted = true;
            break;
        }
    }
    assert!(other_admitted);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn wait_admits_once_capacity_frees() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("waitok"),
        &[
            TokenBucketOption::rate(100.0),
            TokenBucketOption::capacity(1.0),
            TokenBucketOption::ttl(Duration::from_secs(2)),
        ],
    );

    assert!(tb.allow().await?);

    // at 100 tokens/sec the next token lands within ~10ms
    let cancel = CancellationToken::new();
    tb.wait(&cancel, Duration::from_secs(1)).await?;

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn wait_with_zero_budget_fails_fast() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("waitzero"),
        &[
            TokenBucketOption::rate(0.1),
            TokenBucketOption::capacity(1.0),
            TokenBucketOption::ttl(Duration::from_secs(30)),
        ],
    );

    assert!(tb.allow().await?);

    let cancel = CancellationToken::new();
    let err = tb.wait(&cancel, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, LimiterError::Limiter));

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn wait_returns_the_cancellation_cause() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("waitcancel"),
        &[
            TokenBucketOption::rate(0.1),
            TokenBucketOption::capacity(1.0),
            TokenBucketOption::ttl(Duration::from_secs(30)),
        ],
    );

    assert!(tb.allow().await?, "saturate the bucket");

    let cancel = CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        child.cancel();
    });

    let started = Instant::now();
    let err = tb.wait(&cancel, Duration::from_secs(10)).await.unwrap_err();

    assert!(matches!(err, LimiterError::Cancelled), "not a timeout: {err}");
    assert!(started.elapsed() < Duration::from_millis(500));

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn config_factory_drives_the_matched_rule() -> anyhow::Result<()> {
    let key = unique_key("factory");
    let cfg = Conf {
        redis: redis::Redis {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: String::new(),
            password: String::new(),
        },
        rules: vec![LimitRule {
            enable: true,
            key: key.clone(),
            count: 2,
            duration_ms: 2000,
            timeout_ms: 300,
        }],
    };

    let pool = redis::new(cfg.redis.clone()).await.expect(REDIS_REQUIRED);
    let limiter = cfg.create(&key, &pool);
    let cancel = CancellationToken::new();

    // the rule's burst of 2 admits immediately
    limiter.wait(&cancel).await?;
    limiter.wait(&cancel).await?;

    // at 1 admission/sec the next slot needs ~1s, beyond the rule's 300ms
    // wait budget
    let before_third = Instant::now();
    let err = limiter.wait(&cancel).await.unwrap_err();
    assert!(matches!(err, LimiterError::Timeout), "got {err}");
    assert!(before_third.elapsed() >= Duration::from_millis(300));

    limiter.done().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis at 127.0.0.1:6379"]
async fn idle_keys_expire_and_reset() -> anyhow::Result<()> {
    let tb = TokenBucketLimiter::new(
        pool().await,
        unique_key("ttl"),
        &[
            TokenBucketOption::rate(0.001),
            TokenBucketOption::capacity(1.0),
            TokenBucketOption::ttl(Duration::from_millis(300)),
        ],
    );

    assert!(tb.allow().await?);
    assert!(!tb.allow().await?, "no refill at 0.001 tokens/sec");

    // the TTL reaps both keys; the next read sees a fresh full bucket
    sleep(Duration::from_millis(400)).await;
    assert!(tb.allow().await?);

    Ok(())
}
