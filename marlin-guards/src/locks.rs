//! Fail-fast per-symbol locks with TTL auto-release.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use marlin_core::Symbol;
use tracing::{debug, warn};

/// Lock table keyed by symbol. Acquisition never queues: a held,
/// unexpired entry means the caller must skip the signal.
///
/// Entries auto-expire after the TTL so an unhandled failure can never
/// deadlock a symbol permanently. Map mutations happen under a plain
/// `std::sync::Mutex` and never suspend.
#[derive(Clone)]
pub struct SymbolLocks {
    ttl: Duration,
    held: Arc<Mutex<HashMap<Symbol, Instant>>>,
}

impl SymbolLocks {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Try to take the lock for `symbol`. Returns `None` without waiting
    /// when it is already held and not yet expired.
    #[must_use]
    pub fn try_acquire(&self, symbol: &str) -> Option<LockGuard> {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = held.get(symbol) {
            if *existing > now {
                return None;
            }
            warn!(%symbol, "reclaiming expired symbol lock");
        }
        held.insert(symbol.to_string(), expires_at);
        debug!(%symbol, "symbol lock acquired");
        Some(LockGuard {
            held: Arc::clone(&self.held),
            symbol: symbol.to_string(),
            expires_at,
        })
    }

    /// Run `work` while holding the lock for `symbol`.
    ///
    /// Returns `None` when the lock is busy; callers must treat that as
    /// "signal skipped", not an error. The lock is released on every exit
    /// path, including cancellation mid-await, because the guard releases
    /// on drop.
    pub async fn with_lock<T, F, Fut>(&self, symbol: &str, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.try_acquire(symbol)?;
        let result = work().await;
        drop(guard);
        Some(result)
    }

    /// Whether a live (unexpired) lock exists for `symbol`.
    #[must_use]
    pub fn is_locked(&self, symbol: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(symbol).is_some_and(|expiry| *expiry > Instant::now())
    }
}

/// Releases the symbol lock when dropped.
///
/// Release only removes the entry it created: if the TTL lapsed and
/// another task reclaimed the symbol, that newer lock stays intact.
pub struct LockGuard {
    held: Arc<Mutex<HashMap<Symbol, Instant>>>,
    symbol: Symbol,
    expires_at: Instant,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(&self.symbol) == Some(&self.expires_at) {
            held.remove(&self.symbol);
            debug!(symbol = %self.symbol, "symbol lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locks() -> SymbolLocks {
        SymbolLocks::new(Duration::from_secs(5))
    }

    #[test]
    fn second_acquire_fails_fast() {
        let locks = locks();
        let guard = locks.try_acquire("RELIANCE");
        assert!(guard.is_some());
        assert!(locks.try_acquire("RELIANCE").is_none());
        // A different symbol is unaffected.
        assert!(locks.try_acquire("TCS").is_some());
    }

    #[test]
    fn dropping_the_guard_releases() {
        let locks = locks();
        {
            let _guard = locks.try_acquire("INFY");
            assert!(locks.is_locked("INFY"));
        }
        assert!(!locks.is_locked("INFY"));
        assert!(locks.try_acquire("INFY").is_some());
    }

    #[test]
    fn expired_locks_are_reclaimed() {
        let locks = SymbolLocks::new(Duration::from_millis(5));
        let stale = locks.try_acquire("HDFC").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        // TTL lapsed: a new acquisition succeeds despite the live guard.
        let fresh = locks.try_acquire("HDFC");
        assert!(fresh.is_some());
        // The stale guard must not release the reclaimed lock.
        drop(stale);
        assert!(locks.is_locked("HDFC"));
    }

    #[tokio::test]
    async fn with_lock_returns_none_when_busy() {
        let locks = locks();
        let _guard = locks.try_acquire("SBIN").unwrap();
        let skipped = locks.with_lock("SBIN", || async { 1 }).await;
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn with_lock_releases_on_success_and_error_paths() {
        let locks = locks();
        let ok: Option<Result<u32, &str>> =
            locks.with_lock("SBIN", || async { Ok(1) }).await;
        assert_eq!(ok, Some(Ok(1)));
        assert!(!locks.is_locked("SBIN"));

        let err: Option<Result<u32, &str>> =
            locks.with_lock("SBIN", || async { Err("boom") }).await;
        assert_eq!(err, Some(Err("boom")));
        assert!(!locks.is_locked("SBIN"));
    }
}
