//! Protective-order placement with fail-safe position closure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use marlin_broker::{with_retry, BrokerClient, BrokerError, RetryPolicy};
use marlin_core::{
    Direction, EngineEvent, EventBus, OrderId, OrderKind, OrderRequest, Price, Quantity, Symbol,
};
use thiserror::Error;
use tracing::{error, info, warn};

/// Result alias for protective-order operations.
pub type StopResult<T> = Result<T, StopError>;

#[derive(Debug, Error)]
pub enum StopError {
    /// Protection could not be placed; the position was emergency-closed.
    #[error("protection failed for {symbol}, position emergency-closed: {source}")]
    ProtectionFailed {
        symbol: Symbol,
        source: BrokerError,
    },
    /// Protection failed AND the emergency close also failed. The operator
    /// must intervene immediately.
    #[error("protection and emergency close both failed for {symbol}: {detail}")]
    Unprotected { symbol: Symbol, detail: String },
}

/// Places protective stop/target orders after confirmed fills and tracks
/// them for cancellation on square-off or shutdown.
///
/// A filled position must never be left unprotected: if protection cannot
/// be placed, the position is immediately closed at market.
pub struct StopLossManager {
    broker: Arc<dyn BrokerClient>,
    bus: EventBus,
    retry: RetryPolicy,
    live: Mutex<HashMap<Symbol, Vec<OrderId>>>,
}

impl StopLossManager {
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, bus: EventBus, retry: RetryPolicy) -> Self {
        Self {
            broker,
            bus,
            retry,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Protect a freshly filled position with a stop (and optional target).
    ///
    /// On placement failure any already-placed leg is cancelled, exactly one
    /// emergency market close is issued for the filled quantity, and the
    /// operator is alerted through the event bus.
    pub async fn protect(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Quantity,
        stop_loss: Price,
        target: Option<Price>,
        client_id: &str,
    ) -> StopResult<Vec<OrderId>> {
        let exit_side = direction.exit_side();
        let mut placed = Vec::new();

        let mut stop_request = OrderRequest::stop_market(symbol, exit_side, quantity, stop_loss);
        stop_request.client_order_id = Some(format!("{client_id}-sl"));
        match with_retry(self.retry, "place protective stop", || {
            self.broker.place_order(stop_request.clone())
        })
        .await
        {
            Ok(order) => placed.push(order.id),
            Err(err) => {
                return self
                    .fail_safe_close(symbol, exit_side, quantity, placed, err)
                    .await;
            }
        }

        if let Some(target_price) = target {
            let target_request = OrderRequest {
                symbol: symbol.to_string(),
                side: exit_side,
                kind: OrderKind::Limit,
                quantity,
                limit_price: Some(target_price),
                stop_loss: None,
                target: None,
                client_order_id: Some(format!("{client_id}-tp")),
            };
            match with_retry(self.retry, "place target order", || {
                self.broker.place_order(target_request.clone())
            })
            .await
            {
                Ok(order) => placed.push(order.id),
                Err(err) => {
                    return self
                        .fail_safe_close(symbol, exit_side, quantity, placed, err)
                        .await;
                }
            }
        }

        info!(%symbol, orders = placed.len(), "position protected");
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.entry(symbol.to_string())
            .or_default()
            .extend(placed.iter().cloned());
        Ok(placed)
    }

    async fn fail_safe_close(
        &self,
        symbol: &str,
        exit_side: marlin_core::Side,
        quantity: Quantity,
        placed: Vec<OrderId>,
        cause: BrokerError,
    ) -> StopResult<Vec<OrderId>> {
        error!(%symbol, error = %cause, "protective order placement failed, closing position");
        for order_id in &placed {
            if let Err(err) = self.broker.cancel_order(order_id).await {
                warn!(%order_id, error = %err, "failed to cancel dangling protective leg");
            }
        }

        let close = OrderRequest::market(symbol, exit_side, quantity);
        let close_result =
            with_retry(self.retry, "emergency close", || self.broker.place_order(close.clone()))
                .await;

        match close_result {
            Ok(order) => {
                self.bus.publish(EngineEvent::ProtectionFailed {
                    symbol: symbol.to_string(),
                    detail: format!("emergency close placed as {}: {cause}", order.id),
                });
                Err(StopError::ProtectionFailed {
                    symbol: symbol.to_string(),
                    source: cause,
                })
            }
            Err(close_err) => {
                let detail = format!("protection: {cause}; close: {close_err}");
                self.bus.publish(EngineEvent::ProtectionFailed {
                    symbol: symbol.to_string(),
                    detail: detail.clone(),
                });
                Err(StopError::Unprotected {
                    symbol: symbol.to_string(),
                    detail,
                })
            }
        }
    }

    /// Cancel and forget the protective orders for one symbol, called when
    /// its position is closed or squared off.
    pub async fn release(&self, symbol: &str) {
        let orders = {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.remove(symbol).unwrap_or_default()
        };
        for order_id in orders {
            if let Err(err) = self.broker.cancel_order(&order_id).await {
                warn!(%symbol, %order_id, error = %err, "failed to cancel protective order");
            }
        }
    }

    /// Cancel every live protective order. Used by engine shutdown.
    pub async fn cancel_all(&self) {
        let symbols: Vec<Symbol> = {
            let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.keys().cloned().collect()
        };
        for symbol in symbols {
            self.release(&symbol).await;
        }
    }

    /// Number of live protective orders tracked for `symbol`.
    #[must_use]
    pub fn live_count(&self, symbol: &str) -> usize {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.get(symbol).map_or(0, Vec::len)
    }
}
