//! Concurrency guards: per-symbol locking and signal idempotency.
//!
//! Every network call in the pipeline is a suspension point, so two signals
//! for the same symbol can interleave even on a single-threaded runtime.
//! These guards serialize order-affecting work per symbol and reject
//! duplicate signal-driven order attempts.

mod idempotency;
mod locks;

use thiserror::Error;

pub use idempotency::{IdempotencyRecord, IdempotencyRegistry, IdempotencyState};
pub use locks::{LockGuard, SymbolLocks};

/// Result alias for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;

/// Terminal-reject failures raised by the guards. None of these are
/// retryable within the same signal instance. A busy symbol lock is not
/// an error: `SymbolLocks::with_lock` signals it with a `None` sentinel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    /// An unexpired record already covers this (symbol, action, quantity).
    #[error("duplicate signal: {0}")]
    DuplicateSignal(String),
}
