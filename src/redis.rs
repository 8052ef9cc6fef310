//! Connection pooling and raw command plumbing for the Redis store.

use rustis::client::{Config, PooledClientManager, ServerConfig};
use rustis::resp::{self, Value};
use tokio::time::Duration;

use crate::error::{LimiterError, Result};
use crate::scripts::Script;

pub type RedisPool = rustis::bb8::Pool<PooledClientManager>;

/// Connection settings for a standalone Redis server.
///
/// Empty `username`/`password` mean an unauthenticated connection.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Redis {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub async fn new(cfg: Redis) -> std::result::Result<RedisPool, rustis::Error> {
    let config = Config {
        server: ServerConfig::Standalone {
            host: cfg.host,
            port: cfg.port,
        },
        username: Some(cfg.username).filter(|s| !s.is_empty()),
        password: Some(cfg.password).filter(|s| !s.is_empty()),
        connect_timeout: Duration::from_secs(3),
        command_timeout: Duration::from_millis(300),
        keep_alive: Some(Duration::from_secs(65)),
        ..Config::default()
    };

    let manager = PooledClientManager::new(config).unwrap();
    RedisPool::builder()
        .max_size(1000)
        .min_idle(Some(5))
        .max_lifetime(None)
        .idle_timeout(Some(Duration::from_secs(120)))
        .connection_timeout(Duration::from_secs(3))
        .build(manager)
        .await
}

/// Runs `script` against `keys`/`args` as one atomic step.
///
/// The script is addressed by digest (`EVALSHA`); on the first round-trip to
/// a server that has not cached it yet, the `NOSCRIPT` reply triggers one
/// `EVAL` of the full body, which also caches it for subsequent calls.
pub(crate) async fn run_script(
    pool: &RedisPool,
    script: &Script,
    keys: &[String],
    args: &[String],
) -> Result<Value> {
    let cli = pool.get().await?;

    let cmd = build_script_cmd("EVALSHA", script.hash(), keys, args);
    let first = cli.send(cmd, None).await;

    let missing = match &first {
        Ok(v) => v.is_error() && v.to_string().contains("NOSCRIPT"),
        Err(e) => e.to_string().contains("NOSCRIPT"),
    };
    if missing {
        log::debug!("script {} not cached, falling back to EVAL", script.hash());
        let cmd = build_script_cmd("EVAL", script.body(), keys, args);
        return check_reply(cli.send(cmd, None).await.and_then(buf_to_value));
    }

    check_reply(first.and_then(buf_to_value))
}

fn buf_to_value(buf: rustis::resp::RespBuf) -> std::result::Result<Value, rustis::Error> {
    buf.to::<Value>()
}

/// `GET key`, with a missing key read as `None`.
pub(crate) async fn get_value(pool: &RedisPool, key: &str) -> Result<Option<String>> {
    let reply = pool
        .get()
        .await?
        .send(resp::cmd("GET").arg(key.to_string()), None)
        .await
        .and_then(buf_to_value);

    match check_reply(reply)? {
        Value::Nil => Ok(None),
        other => Ok(Some(other.into::<String>()?)),
    }
}

/// `ZCOUNT key min +inf`: cardinality of the log at or above `min_score`.
pub(crate) async fn zcount_from(pool: &RedisPool, key: &str, min_score: u64) -> Result<i64> {
    let cmd = resp::cmd("ZCOUNT")
        .arg(key.to_string())
        .arg(min_score.to_string())
        .arg("+inf");
    let reply = pool.get().await?.send(cmd, None).await.and_then(buf_to_value);
    Ok(check_reply(reply)?.into::<i64>()?)
}

fn build_script_cmd(
    name: &'static str,
    script: &str,
    keys: &[String],
    args: &[String],
) -> resp::Command {
    let mut cmd = resp::cmd(name).arg(script.to_string()).arg(keys.len() as u64);
    for key in keys {
        cmd = cmd.arg(key.clone());
    }
    for arg in args {
        cmd = cmd.arg(arg.clone());
    }
    cmd
}

fn check_reply(reply: std::result::Result<Value, rustis::Error>) -> Result<Value> {
    let value = reply?;
    if matches!(value, Value::Error(_)) {
        return Err(LimiterError::Script(value.to_string()));
    }
    Ok(value)
}

/// Pool for unit tests: configured but never connected.
#[cfg(test)]
pub(crate) fn test_pool() -> RedisPool {
    let config = Config {
        server: ServerConfig::Standalone {
            host: "127.0.0.1".to_string(),
            port: 6379,
        },
        ..Config::default()
    };
    let manager = PooledClientManager::new(config).unwrap();
    RedisPool::builder().max_size(1).build_unchecked(manager)
}
