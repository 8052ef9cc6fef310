//! Server-side Lua programs and their content-addressed digests.
//!
//! Each script reads, mutates and writes its keys as one indivisible step on
//! the Redis server and returns an integer admission verdict (1 = admitted,
//! 0 = denied). The bodies and digests are process-wide immutable singletons;
//! no runtime registration is required.

use std::sync::LazyLock;

use sha1::{Digest, Sha1};

/// Atomic token bucket refill-and-take.
///
/// KEYS[1] = tokens key (current token count, float)
/// KEYS[2] = ts key     (last refill time, unix milliseconds)
///
/// ARGV[1] = now (ms)
/// ARGV[2] = rate (tokens/sec)
/// ARGV[3] = capacity
/// ARGV[4] = requested tokens (usually 1)
/// ARGV[5] = ttl (ms)
///
/// A missing key pair is read as a full bucket updated now. A denial writes
/// nothing, so refused admissions neither consume tokens nor advance the
/// timestamp.
pub static TOKEN_BUCKET: &str = r#"
local tokensKey = KEYS[1]
local tsKey     = KEYS[2]

local now      = tonumber(ARGV[1])
local rate     = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local req      = tonumber(ARGV[4])
local ttl      = tonumber(ARGV[5])

-- first use reads as a full bucket updated now
local tokens = tonumber(redis.call('GET', tokensKey)) or capacity
local lastTs = tonumber(redis.call('GET', tsKey)) or now

-- clamp clock regressions to a zero delta
local delta = now - lastTs
if delta < 0 then
  delta = 0
end

local refill = (delta * rate) / 1000
tokens = tokens + refill
if tokens > capacity then
  tokens = capacity
end

if tokens < req then
  return 0
end

tokens = tokens - req

redis.call('SET', tokensKey, tokens, 'PX', ttl)
redis.call('SET', tsKey, now, 'PX', ttl)

return 1
"#;

/// Atomic leaky bucket drain-and-pour.
///
/// KEYS[1] = bucket key (current water level, float)
/// KEYS[2] = ts key     (last drain time, unix milliseconds)
///
/// ARGV[1] = now (ms)
/// ARGV[2] = leak rate (units/sec)
/// ARGV[3] = capacity (maximum level)
/// ARGV[4] = requested units (usually 1)
/// ARGV[5] = ttl (ms)
///
/// Admission succeeds iff level + request fits under capacity after the
/// elapsed leak is applied. A denial writes nothing.
pub static LEAKY_BUCKET: &str = r#"
local bucketKey = KEYS[1]
local tsKey     = KEYS[2]

local now      = tonumber(ARGV[1])
local leakRate = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local req      = tonumber(ARGV[4])
local ttl      = tonumber(ARGV[5])

-- first use reads as an empty bucket updated now
local level = tonumber(redis.call('GET', bucketKey)) or 0
local lastTs = tonumber(redis.call('GET', tsKey)) or now

local delta = now - lastTs
if delta < 0 then
  delta = 0
end

local leak = (delta * leakRate) / 1000
level = level - leak
if level < 0 then
  level = 0
end

if level + req > capacity then
  return 0
end

level = level + req

redis.call('SET', bucketKey, level, 'PX', ttl)
redis.call('SET', tsKey, now, 'PX', ttl)

return 1
"#;

/// Atomic sliding window log purge-count-and-append.
///
/// KEYS[1] = log key (ZSET of admission timestamps)
/// KEYS[2] = seq key (string counter, keeps members unique within one ms)
///
/// ARGV[1] = now (ms)
/// ARGV[2] = window (ms)
/// ARGV[3] = limit (max admissions per window)
/// ARGV[4] = ttl (ms)
///
/// Entries older than the window are purged before the verdict; a denial
/// leaves the log untouched.
pub static SLIDING_WINDOW: &str = r#"
local logKey = KEYS[1]
local seqKey = KEYS[2]

local now    = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit  = tonumber(ARGV[3])
local ttl    = tonumber(ARGV[4])

local minScore = now - window

redis.call('ZREMRANGEBYSCORE', logKey, 0, minScore)

local count = redis.call('ZCARD', logKey)
if count >= limit then
  return 0
end

-- unique member even for same-millisecond admissions
local seq = redis.call('INCR', seqKey)
local member = now .. '-' .. seq

redis.call('ZADD', logKey, now, member)

redis.call('PEXPIRE', logKey, ttl)
redis.call('PEXPIRE', seqKey, ttl)

return 1
"#;

/// A Lua script body paired with the SHA-1 digest Redis assigns it.
pub(crate) struct Script {
    body: &'static str,
    hash: String,
}

impl Script {
    fn new(body: &'static str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(body.as_bytes());
        Script {
            body,
            hash: hex::encode(hasher.finalize()),
        }
    }

    pub(crate) fn body(&self) -> &'static str {
        self.body
    }

    pub(crate) fn hash(&self) -> &str {
        &self.hash
    }
}

pub(crate) static TOKEN_BUCKET_SCRIPT: LazyLock<Script> =
    LazyLock::new(|| Script::new(TOKEN_BUCKET));

pub(crate) static LEAKY_BUCKET_SCRIPT: LazyLock<Script> =
    LazyLock::new(|| Script::new(LEAKY_BUCKET));

pub(crate) static SLIDING_WINDOW_SCRIPT: LazyLock<Script> =
    LazyLock::new(|| Script::new(SLIDING_WINDOW));

/// SHA-1 hex digest of the token bucket script, as Redis reports it.
///
/// Test harnesses can match an `EVALSHA` invocation against this value
/// without recomputing the hash themselves.
pub fn token_bucket_script_hash() -> &'static str {
    TOKEN_BUCKET_SCRIPT.hash()
}

/// SHA-1 hex digest of the leaky bucket script.
pub fn leaky_bucket_script_hash() -> &'static str {
    LEAKY_BUCKET_SCRIPT.hash()
}

/// SHA-1 hex digest of the sliding window script.
pub fn sliding_window_script_hash() -> &'static str {
    SLIDING_WINDOW_SCRIPT.hash()
}
