//! Broker port: the contract every execution venue must satisfy.

use std::any::Any;

use async_trait::async_trait;
use marlin_core::{Fill, Order, OrderId, OrderRequest, Price, Quantity, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod retry;

pub use retry::{with_retry, RetryPolicy};

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failure taxonomy for broker interactions.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network-level failure; safe to retry.
    #[error("transport error: {0}")]
    Transport(String),
    /// Credentials rejected or session expired.
    #[error("authentication error: {0}")]
    Authentication(String),
    /// The request itself is malformed; retrying will not help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The venue rejected the request with a business error.
    #[error("exchange error {code}: {message}")]
    Exchange { code: i64, message: String },
    /// The referenced order does not exist at the broker.
    #[error("unknown order: {0}")]
    UnknownOrder(OrderId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Whether a bounded retry is worth attempting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

/// A position as the broker reports it; the authoritative record
/// reconciliation diffs against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    /// Positive for long, negative for short.
    pub signed_quantity: Quantity,
    pub avg_price: Price,
    pub last_price: Option<Price>,
}

/// Metadata describing a connected venue.
#[derive(Clone, Debug)]
pub struct BrokerInfo {
    pub name: &'static str,
    pub paper_trading: bool,
}

/// Async interface to an execution venue.
///
/// Every method is a suspension point; callers that need per-symbol
/// serialization must hold the symbol lock across the whole sequence.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn info(&self) -> BrokerInfo;

    async fn connect(&self) -> BrokerResult<()>;
    async fn disconnect(&self) -> BrokerResult<()>;

    /// Last traded price for a symbol.
    async fn last_price(&self, symbol: &str) -> BrokerResult<Price>;

    /// Available account balance in the quote currency.
    async fn account_balance(&self) -> BrokerResult<Decimal>;

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order>;

    async fn cancel_order(&self, order_id: &OrderId) -> BrokerResult<()>;

    /// Current broker-side view of one order; `None` when it has vanished
    /// from the book entirely.
    async fn get_order(&self, order_id: &OrderId) -> BrokerResult<Option<Order>>;

    async fn open_orders(&self) -> BrokerResult<Vec<Order>>;

    /// Authoritative position list.
    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    /// Trade-fill stream. Fills arrive asynchronously relative to the
    /// signal that caused them.
    fn fill_stream(&self) -> broadcast::Receiver<Fill>;

    /// Escape hatch for connector-specific capabilities.
    fn as_any(&self) -> &dyn Any;
}
