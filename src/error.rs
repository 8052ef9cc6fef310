use thiserror::Error;

/// Errors surfaced by every limiter in this crate.
///
/// Transport errors from the Redis client are bubbled up verbatim; the
/// library never retries them. Whether a caller fails open or closed on a
/// transport error is the caller's decision.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Admission was denied and the caller asked not to wait.
    #[error("rate limit exceeded")]
    Limiter,

    /// Admission was denied and the wait deadline expired.
    #[error("rate limited (timeout)")]
    Timeout,

    /// The caller's cancellation token fired during a blocking wait.
    #[error("rate limiter wait cancelled")]
    Cancelled,

    /// Invalid argument at call time, e.g. `allow_n` with `n <= 0`.
    #[error("{0}")]
    InvalidRequest(String),

    /// The store answered with a payload shape the protocol does not allow.
    #[error("{0}")]
    Protocol(String),

    /// A state key disappeared between the reads of one `state` call.
    #[error("missing state key: {0}")]
    MissingState(String),

    /// An error reply reported by the Redis server.
    #[error("redis error reply: {0}")]
    Script(String),

    #[error(transparent)]
    Redis(#[from] rustis::Error),

    #[error("redis pool error: {0}")]
    Pool(#[from] rustis::bb8::RunError<rustis::Error>),
}

pub type Result<T> = std::result::Result<T, LimiterError>;
