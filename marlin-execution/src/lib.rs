//! Signal-to-order execution pipeline.
//!
//! One signal enters; at most one order leaves. All order-affecting work
//! for a symbol runs inside that symbol's lock, and every failure mode maps
//! to a terminal [`SignalOutcome`] so nothing escapes the lock boundary.

mod fill_monitor;
mod stops;

use std::sync::Arc;
use std::time::Duration;

use marlin_broker::{with_retry, BrokerClient, RetryPolicy};
use marlin_core::{
    Direction, EngineEvent, EventBus, Order, OrderId, OrderKind, OrderRequest, Price, Quantity,
    Side, Signal, Symbol,
};
use marlin_guards::{IdempotencyRegistry, SymbolLocks};
use marlin_portfolio::PositionBook;
use marlin_risk::{RiskManager, RiskVerdict};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

pub use fill_monitor::{FillMonitor, FillOutcome};
pub use marlin_core::TradingMode;
pub use stops::{StopError, StopLossManager, StopResult};

/// Knobs for the pipeline, read once at startup.
#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    pub mode: TradingMode,
    /// Fractional buffer applied to the observed price: buys adjusted up,
    /// sells down. A conservative estimate, not the realized fill price.
    pub slippage_buffer: Decimal,
    /// Default stop distance as a fraction of the adjusted entry price,
    /// used when the signal carries no stop.
    pub default_stop_pct: Decimal,
    /// Hard notional cap per position before margin scaling.
    pub max_capital: Decimal,
    /// Band around the observed price for limit entries.
    pub limit_tolerance: Decimal,
    /// Client-side cancel deadline for unfilled limit entries.
    pub order_timeout: Duration,
    pub fill_poll_interval: Duration,
    pub fill_deadline: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Limit,
            slippage_buffer: Decimal::new(1, 3),
            default_stop_pct: Decimal::new(1, 2),
            max_capital: Decimal::from(100_000u32),
            limit_tolerance: Decimal::new(1, 3),
            order_timeout: Duration::from_secs(20),
            fill_poll_interval: Duration::from_secs(2),
            fill_deadline: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Terminal result of processing one signal.
#[derive(Clone, Debug)]
pub enum SignalOutcome {
    /// An order was placed; `fill` classifies what became of it.
    Executed {
        order_id: OrderId,
        fill: FillOutcome,
        /// False when protective placement failed and the position was
        /// emergency-closed instead.
        protected: bool,
    },
    /// A CLOSE signal ran its course.
    ClosedPosition {
        symbol: Symbol,
        order_id: Option<OrderId>,
    },
    /// Lock busy or nothing to do. Not an error.
    Skipped { reason: String },
    /// Risk check failed or the signal is a duplicate. Final for this
    /// signal instance.
    Rejected { reason: String },
    /// Transient failures exhausted their retries; no order is live.
    Aborted { reason: String },
}

/// Orchestrates pricing, sizing, risk, placement and fill confirmation.
pub struct ExecutionPipeline {
    broker: Arc<dyn BrokerClient>,
    risk: Arc<RiskManager>,
    book: Arc<PositionBook>,
    stops: Arc<StopLossManager>,
    locks: SymbolLocks,
    idempotency: IdempotencyRegistry,
    monitor: FillMonitor,
    bus: EventBus,
    config: ExecutionConfig,
}

impl ExecutionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        risk: Arc<RiskManager>,
        book: Arc<PositionBook>,
        stops: Arc<StopLossManager>,
        locks: SymbolLocks,
        idempotency: IdempotencyRegistry,
        bus: EventBus,
        config: ExecutionConfig,
    ) -> Self {
        let monitor = FillMonitor::new(
            Arc::clone(&broker),
            config.fill_poll_interval,
            config.fill_deadline,
        );
        Self {
            broker,
            risk,
            book,
            stops,
            locks,
            idempotency,
            monitor,
            bus,
            config,
        }
    }

    /// Process one signal end to end under the symbol lock.
    ///
    /// A busy lock means another operation is mid-flight for this symbol;
    /// the signal is skipped, never queued.
    pub async fn handle_signal(&self, signal: &Signal) -> SignalOutcome {
        let symbol = signal.symbol.clone();
        match self
            .locks
            .with_lock(&symbol, || self.process_locked(signal))
            .await
        {
            Some(outcome) => outcome,
            None => {
                info!(%symbol, signal_id = %signal.id, "symbol locked, skipping signal");
                SignalOutcome::Skipped {
                    reason: format!("symbol {symbol} is locked by an in-flight operation"),
                }
            }
        }
    }

    /// Close any open position for `symbol` under its lock.
    pub async fn close_position(&self, symbol: &str) -> SignalOutcome {
        match self
            .locks
            .with_lock(symbol, || self.close_locked(symbol))
            .await
        {
            Some(outcome) => outcome,
            None => SignalOutcome::Skipped {
                reason: format!("symbol {symbol} is locked by an in-flight operation"),
            },
        }
    }

    /// Close every open position, retrying briefly when a symbol's lock is
    /// busy. Used by square-off and emergency shutdown.
    pub async fn close_all(&self, reason: &str) -> Vec<SignalOutcome> {
        let positions = self.book.open_positions();
        info!(count = positions.len(), %reason, "closing all open positions");
        let mut outcomes = Vec::with_capacity(positions.len());
        for position in positions {
            let mut outcome = self.close_position(&position.symbol).await;
            for _ in 0..3 {
                if !matches!(outcome, SignalOutcome::Skipped { .. }) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
                outcome = self.close_position(&position.symbol).await;
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn process_locked(&self, signal: &Signal) -> SignalOutcome {
        let Some(side) = signal.action.side() else {
            // Closing only ever reduces risk: skip pricing/sizing/risk.
            return self.close_locked(&signal.symbol).await;
        };

        let key = match self.idempotency.begin(
            &signal.symbol,
            signal.action,
            signal.quantity.unwrap_or_default(),
        ) {
            Ok(key) => key,
            Err(err) => {
                warn!(signal_id = %signal.id, error = %err, "duplicate signal rejected");
                return SignalOutcome::Rejected {
                    reason: err.to_string(),
                };
            }
        };

        self.execute_entry(signal, side, &key).await
    }

    async fn execute_entry(&self, signal: &Signal, side: Side, key: &str) -> SignalOutcome {
        let symbol = &signal.symbol;

        let last = match with_retry(self.config.retry, "fetch last price", || {
            self.broker.last_price(symbol)
        })
        .await
        {
            Ok(price) => price,
            Err(err) => {
                self.idempotency.fail(key);
                return SignalOutcome::Aborted {
                    reason: format!("price fetch failed for {symbol}: {err}"),
                };
            }
        };

        let expected = self.expected_entry_price(last, side);
        let stop = signal
            .stop_loss
            .unwrap_or_else(|| self.default_stop(expected, side));

        let quantity = match signal.quantity {
            Some(quantity) => quantity,
            None => self.derive_quantity(signal, expected, stop),
        };
        if quantity <= Decimal::ZERO {
            self.idempotency.fail(key);
            warn!(%symbol, "computed quantity is zero, no order placed");
            return SignalOutcome::Aborted {
                reason: format!("computed quantity for {symbol} is zero"),
            };
        }

        // Stale balance must never back a risk decision.
        match with_retry(self.config.retry, "refresh balance", || {
            self.broker.account_balance()
        })
        .await
        {
            Ok(balance) => self.risk.set_balance(balance),
            Err(err) => {
                self.idempotency.fail(key);
                return SignalOutcome::Aborted {
                    reason: format!("balance refresh failed: {err}"),
                };
            }
        }

        if let RiskVerdict::Rejected { reason } =
            self.risk
                .check_order_risk(symbol, side, quantity, expected, stop)
        {
            self.idempotency.fail(key);
            warn!(%symbol, %reason, "risk check rejected order");
            return SignalOutcome::Rejected { reason };
        }

        let request = self.build_request(signal, side, quantity, last, stop);
        let order = match with_retry(self.config.retry, "place order", || {
            self.broker.place_order(request.clone())
        })
        .await
        {
            Ok(order) => order,
            Err(err) => {
                self.idempotency.fail(key);
                return SignalOutcome::Aborted {
                    reason: format!("order placement failed for {symbol}: {err}"),
                };
            }
        };
        self.idempotency.complete(key, order.id.clone());
        info!(
            order_id = %order.id,
            %symbol,
            ?side,
            %quantity,
            expected_price = %expected,
            "order placed"
        );

        let fill = self.confirm_fill(&order).await;
        self.finish_entry(signal, side, stop, order, fill).await
    }

    async fn finish_entry(
        &self,
        signal: &Signal,
        side: Side,
        stop: Price,
        order: Order,
        fill: FillOutcome,
    ) -> SignalOutcome {
        let symbol = &signal.symbol;
        let filled = fill.filled_quantity();
        if filled.is_zero() {
            warn!(order_id = %order.id, ?fill, "no quantity filled");
            return SignalOutcome::Executed {
                order_id: order.id,
                fill,
                protected: true,
            };
        }

        let avg_price = match &fill {
            FillOutcome::Complete { avg_price, .. } => *avg_price,
            _ => order
                .avg_fill_price
                .or(order.request.limit_price)
                .unwrap_or(stop),
        };
        self.bus.publish(EngineEvent::TradeExecuted {
            symbol: symbol.clone(),
            side,
            quantity: filled,
            price: avg_price,
            order_id: order.id.clone(),
        });

        let mut protected = true;
        if self.config.mode == TradingMode::Limit {
            let result = self
                .stops
                .protect(
                    symbol,
                    Direction::from_side(side),
                    filled,
                    stop,
                    signal.target,
                    &order.id,
                )
                .await;
            if let Err(err) = result {
                error!(%symbol, error = %err, "position left pipeline via emergency close");
                protected = false;
            }
        }
        if protected {
            self.book.set_levels(symbol, Some(stop), signal.target);
        }

        SignalOutcome::Executed {
            order_id: order.id,
            fill,
            protected,
        }
    }

    async fn close_locked(&self, symbol: &str) -> SignalOutcome {
        let Some(position) = self.book.position(symbol) else {
            return SignalOutcome::Skipped {
                reason: format!("no open position for {symbol}"),
            };
        };

        // Drop protection first so the closing fill cannot race a stop.
        self.stops.release(symbol).await;

        let request = OrderRequest::market(symbol, position.direction.exit_side(), position.quantity);
        let order = match with_retry(self.config.retry, "place close order", || {
            self.broker.place_order(request.clone())
        })
        .await
        {
            Ok(order) => order,
            Err(err) => {
                return SignalOutcome::Aborted {
                    reason: format!("close order placement failed for {symbol}: {err}"),
                };
            }
        };

        let fill = self.monitor.wait_for_fill(&order.id, position.quantity).await;
        if let FillOutcome::Complete { avg_price, filled } = &fill {
            // Approximate slippage against the last mark; the true entry
            // order fill price is not threaded through position state.
            let approx_slippage = (position.current_price - avg_price).abs();
            info!(
                %symbol,
                exit_price = %avg_price,
                quantity = %filled,
                %approx_slippage,
                "position close executed"
            );
            self.bus.publish(EngineEvent::TradeExecuted {
                symbol: symbol.to_string(),
                side: position.direction.exit_side(),
                quantity: *filled,
                price: *avg_price,
                order_id: order.id.clone(),
            });
        } else {
            warn!(%symbol, ?fill, "close order did not fill cleanly");
        }

        SignalOutcome::ClosedPosition {
            symbol: symbol.to_string(),
            order_id: Some(order.id),
        }
    }

    async fn confirm_fill(&self, order: &Order) -> FillOutcome {
        match self.config.mode {
            TradingMode::Bracket => {
                self.monitor
                    .wait_for_fill(&order.id, order.request.quantity)
                    .await
            }
            TradingMode::Limit => {
                // The client-side timeout races fill confirmation. On a
                // tie the cancellation wins and no further processing
                // happens for this attempt.
                tokio::select! {
                    biased;
                    () = tokio::time::sleep(self.config.order_timeout) => {
                        self.cancel_on_timeout(order).await
                    }
                    outcome = self.monitor.wait_for_fill(&order.id, order.request.quantity) => outcome,
                }
            }
        }
    }

    /// The venue can fill between the monitor's last poll and the timeout,
    /// making the cancel a no-op on a terminal order. Re-check the order
    /// once so a filled position is never reported as cancelled.
    async fn cancel_on_timeout(&self, order: &Order) -> FillOutcome {
        if let Err(err) = self.broker.cancel_order(&order.id).await {
            warn!(order_id = %order.id, error = %err, "timeout cancel failed");
        }
        match self.broker.get_order(&order.id).await {
            Ok(Some(latest)) if !latest.filled_quantity.is_zero() => {
                info!(
                    order_id = %order.id,
                    filled = %latest.filled_quantity,
                    "order filled before the timeout cancel took effect"
                );
                if latest.filled_quantity >= order.request.quantity {
                    FillOutcome::Complete {
                        filled: latest.filled_quantity,
                        avg_price: latest.avg_fill_price.unwrap_or_default(),
                    }
                } else {
                    FillOutcome::Partial {
                        filled: latest.filled_quantity,
                    }
                }
            }
            Ok(_) => {
                info!(order_id = %order.id, "unfilled order cancelled on client-side timeout");
                FillOutcome::Failed {
                    reason: format!("order {} cancelled: client-side timeout", order.id),
                }
            }
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "post-cancel order check failed");
                FillOutcome::Failed {
                    reason: format!("order {} cancelled: client-side timeout", order.id),
                }
            }
        }
    }

    fn expected_entry_price(&self, observed: Price, side: Side) -> Price {
        adjust_for_slippage(observed, side, self.config.slippage_buffer)
    }

    fn default_stop(&self, entry: Price, side: Side) -> Price {
        default_stop_price(entry, side, self.config.default_stop_pct)
    }

    fn derive_quantity(&self, signal: &Signal, expected: Price, stop: Price) -> Quantity {
        if expected <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let margin = signal.margin_multiplier.unwrap_or(Decimal::ONE);
        let capital_qty = (self.config.max_capital * margin / expected).floor();
        let risk_qty = self.risk.position_size(expected, stop, None);
        capital_qty.min(risk_qty)
    }

    fn build_request(
        &self,
        signal: &Signal,
        side: Side,
        quantity: Quantity,
        observed: Price,
        stop: Price,
    ) -> OrderRequest {
        let client_order_id = Some(signal.id.to_string());
        match self.config.mode {
            TradingMode::Bracket => OrderRequest {
                symbol: signal.symbol.clone(),
                side,
                kind: OrderKind::Bracket,
                quantity,
                limit_price: None,
                stop_loss: Some(stop),
                target: signal.target,
                client_order_id,
            },
            TradingMode::Limit => {
                // A marketable limit: priced just through the observed
                // price so it fills quickly but caps the damage.
                let band = observed * self.config.limit_tolerance;
                let limit_price = match side {
                    Side::Buy => observed + band,
                    Side::Sell => observed - band,
                };
                OrderRequest {
                    symbol: signal.symbol.clone(),
                    side,
                    kind: OrderKind::Limit,
                    quantity,
                    limit_price: Some(limit_price),
                    stop_loss: None,
                    target: None,
                    client_order_id,
                }
            }
        }
    }

    /// Direct access for components that share this pipeline's book.
    #[must_use]
    pub fn book(&self) -> Arc<PositionBook> {
        Arc::clone(&self.book)
    }

    #[must_use]
    pub fn stops(&self) -> Arc<StopLossManager> {
        Arc::clone(&self.stops)
    }
}

/// Conservative expected execution price: buys adjusted up, sells down.
fn adjust_for_slippage(observed: Price, side: Side, buffer: Decimal) -> Price {
    match side {
        Side::Buy => observed * (Decimal::ONE + buffer),
        Side::Sell => observed * (Decimal::ONE - buffer),
    }
}

/// Default protective stop offset off the adjusted entry price.
fn default_stop_price(entry: Price, side: Side, offset_pct: Decimal) -> Price {
    match side {
        Side::Buy => entry * (Decimal::ONE - offset_pct),
        Side::Sell => entry * (Decimal::ONE + offset_pct),
    }
}
