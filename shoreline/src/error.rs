use std::io;

use thiserror::Error;

/// Errors surfaced by the shoreline engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// io_uring could not be set up (missing kernel features, bad params).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// All connection slots are in use.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// A system resource limit is too low (e.g. RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
}

/// Returned by [`try_sleep`](crate::try_sleep) and
/// [`try_timeout`](crate::try_timeout) when no timer slot is free.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timer slot pool exhausted")]
pub struct TimerExhausted;
