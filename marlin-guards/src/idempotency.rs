//! Idempotency registry keyed by (symbol, action, quantity).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use marlin_core::{OrderId, Quantity, SignalAction};
use tracing::debug;

use crate::{GuardError, GuardResult};

/// Lifecycle of one signal-driven order attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdempotencyState {
    /// Work is in flight; duplicates must be rejected.
    Pending,
    /// An order was placed; duplicates within the window are rejected.
    Completed,
    /// Placement failed; a later signal may retry the same key.
    Failed,
}

#[derive(Clone, Debug)]
pub struct IdempotencyRecord {
    pub state: IdempotencyState,
    pub order_id: Option<OrderId>,
    pub created_at: Instant,
}

/// Registry of recent order attempts.
///
/// Records expire after a validity window that is independent of the
/// symbol-lock TTL: a lock protects one in-flight operation, a record
/// protects against re-submitting the same intent minutes later.
#[derive(Clone)]
pub struct IdempotencyRegistry {
    window: Duration,
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
}

impl IdempotencyRegistry {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Derive the registry key for a signal. Quantities are normalized so
    /// `10` and `10.00` map to the same attempt.
    #[must_use]
    pub fn key(symbol: &str, action: SignalAction, quantity: Quantity) -> String {
        format!("{symbol}:{}:{}", action.as_str(), quantity.normalize())
    }

    /// Register a new attempt, rejecting duplicates.
    ///
    /// An unexpired `Pending` or `Completed` record for the same key means
    /// this signal is a duplicate. A `Failed` or expired record is replaced
    /// and the attempt proceeds.
    pub fn begin(
        &self,
        symbol: &str,
        action: SignalAction,
        quantity: Quantity,
    ) -> GuardResult<String> {
        let key = Self::key(symbol, action, quantity);
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.retain(|_, record| now.duration_since(record.created_at) < self.window);
        if let Some(existing) = records.get(&key) {
            if existing.state != IdempotencyState::Failed {
                return Err(GuardError::DuplicateSignal(key));
            }
        }
        records.insert(
            key.clone(),
            IdempotencyRecord {
                state: IdempotencyState::Pending,
                order_id: None,
                created_at: now,
            },
        );
        debug!(%key, "idempotency record opened");
        Ok(key)
    }

    /// Mark the attempt complete with the order it produced.
    pub fn complete(&self, key: &str, order_id: OrderId) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(key) {
            record.state = IdempotencyState::Completed;
            record.order_id = Some(order_id);
        }
    }

    /// Mark the attempt failed, leaving the key eligible for retry.
    pub fn fail(&self, key: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(key) {
            record.state = IdempotencyState::Failed;
            record.order_id = None;
        }
    }

    /// Current record for a key, if any unexpired one exists.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(key)
            .filter(|record| record.created_at.elapsed() < self.window)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn registry() -> IdempotencyRegistry {
        IdempotencyRegistry::new(Duration::from_secs(60))
    }

    #[test]
    fn key_normalizes_quantity() {
        assert_eq!(
            IdempotencyRegistry::key("TCS", SignalAction::Buy, dec!(10)),
            IdempotencyRegistry::key("TCS", SignalAction::Buy, dec!(10.00)),
        );
    }

    #[test]
    fn pending_record_rejects_duplicate() {
        let registry = registry();
        let key = registry.begin("TCS", SignalAction::Buy, dec!(10)).unwrap();
        let duplicate = registry.begin("TCS", SignalAction::Buy, dec!(10));
        assert_eq!(duplicate, Err(GuardError::DuplicateSignal(key)));
    }

    #[test]
    fn completed_record_rejects_duplicate_within_window() {
        let registry = registry();
        let key = registry.begin("TCS", SignalAction::Sell, dec!(5)).unwrap();
        registry.complete(&key, "ord-1".into());
        assert!(registry.begin("TCS", SignalAction::Sell, dec!(5)).is_err());
        let record = registry.get(&key).unwrap();
        assert_eq!(record.state, IdempotencyState::Completed);
        assert_eq!(record.order_id.as_deref(), Some("ord-1"));
    }

    #[test]
    fn failed_record_allows_retry() {
        let registry = registry();
        let key = registry.begin("INFY", SignalAction::Buy, dec!(3)).unwrap();
        registry.fail(&key);
        assert!(registry.begin("INFY", SignalAction::Buy, dec!(3)).is_ok());
    }

    #[test]
    fn records_expire_after_the_window() {
        let registry = IdempotencyRegistry::new(Duration::from_millis(5));
        let key = registry.begin("SBIN", SignalAction::Buy, dec!(1)).unwrap();
        registry.complete(&key, "ord-2".into());
        std::thread::sleep(Duration::from_millis(10));
        assert!(registry.get(&key).is_none());
        assert!(registry.begin("SBIN", SignalAction::Buy, dec!(1)).is_ok());
    }

    #[test]
    fn different_quantities_are_distinct_attempts() {
        let registry = registry();
        registry.begin("TCS", SignalAction::Buy, dec!(10)).unwrap();
        assert!(registry.begin("TCS", SignalAction::Buy, dec!(20)).is_ok());
    }
}
