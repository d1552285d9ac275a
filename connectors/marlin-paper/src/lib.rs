//! Paper broker: an in-process venue with scriptable fill behavior.
//!
//! Serves two roles: the execution venue in paper mode, and the recording
//! test double behind the pipeline's integration tests. Fill behavior and
//! transient-failure injection are adjustable at runtime.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use marlin_broker::{BrokerClient, BrokerError, BrokerInfo, BrokerPosition, BrokerResult};
use marlin_core::{
    Fill, Order, OrderId, OrderKind, OrderRequest, OrderStatus, Price, Quantity, Side, Symbol,
};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// How the venue treats newly placed orders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillBehavior {
    /// Fill the full quantity at once.
    Immediate,
    /// Accept the order but never fill it.
    Never,
    /// Reject every order outright.
    Reject,
    /// Fill a fixed numerator/denominator fraction of the quantity, then stall.
    Partial(u32, u32),
}

struct PaperState {
    prices: HashMap<Symbol, Price>,
    balance: Decimal,
    orders: HashMap<OrderId, Order>,
    positions: HashMap<Symbol, BrokerPosition>,
    placed: Vec<OrderRequest>,
    behavior: FillBehavior,
    fail_prices: u32,
    fail_balances: u32,
    fail_orders: u32,
    fail_orders_skip: u32,
    next_id: u64,
}

impl Default for PaperState {
    fn default() -> Self {
        Self {
            prices: HashMap::new(),
            balance: Decimal::ZERO,
            orders: HashMap::new(),
            positions: HashMap::new(),
            placed: Vec::new(),
            behavior: FillBehavior::Immediate,
            fail_prices: 0,
            fail_balances: 0,
            fail_orders: 0,
            fail_orders_skip: 0,
            next_id: 1,
        }
    }
}

/// In-memory broker. All state sits behind one mutex; methods lock
/// briefly and never suspend while holding it.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    fills: broadcast::Sender<Fill>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        let (fills, _) = broadcast::channel(128);
        Self {
            state: Mutex::new(PaperState::default()),
            fills,
        }
    }
}

impl PaperBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: Price) {
        let mut state = self.lock();
        state.prices.insert(symbol.to_string(), price);
    }

    pub fn deposit(&self, balance: Decimal) {
        self.lock().balance = balance;
    }

    pub fn set_fill_behavior(&self, behavior: FillBehavior) {
        self.lock().behavior = behavior;
    }

    /// Make the next `n` price lookups fail with a transport error.
    pub fn fail_next_prices(&self, n: u32) {
        self.lock().fail_prices = n;
    }

    /// Make the next `n` balance lookups fail with a transport error.
    pub fn fail_next_balances(&self, n: u32) {
        self.lock().fail_balances = n;
    }

    /// Make the next `n` order placements fail with a transport error.
    pub fn fail_next_orders(&self, n: u32) {
        let mut state = self.lock();
        state.fail_orders = n;
        state.fail_orders_skip = 0;
    }

    /// Let `skip` placements through, then fail the following `n`.
    pub fn fail_orders_after(&self, skip: u32, n: u32) {
        let mut state = self.lock();
        state.fail_orders = n;
        state.fail_orders_skip = skip;
    }

    /// Every request this venue has accepted, in placement order.
    #[must_use]
    pub fn placed_requests(&self) -> Vec<OrderRequest> {
        self.lock().placed.clone()
    }

    /// Remove an order from the book entirely, as if the venue lost it.
    pub fn vanish_order(&self, order_id: &str) {
        self.lock().orders.remove(order_id);
    }

    /// Fill a resting order in full, as if the venue matched it late.
    pub fn fill_resting_order(&self, order_id: &str) {
        let mut state = self.lock();
        let Some(mut order) = state.orders.remove(order_id) else {
            return;
        };
        if !order.status.is_terminal() {
            let remaining = order.request.quantity - order.filled_quantity;
            self.fill_order(&mut state, &mut order, remaining);
        }
        state.orders.insert(order_id.to_string(), order);
    }

    /// Override the broker-side position record, bypassing fills.
    pub fn set_broker_position(&self, symbol: &str, signed_quantity: Quantity, avg_price: Price) {
        let mut state = self.lock();
        if signed_quantity.is_zero() {
            state.positions.remove(symbol);
            return;
        }
        let last_price = state.prices.get(symbol).copied();
        state.positions.insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                signed_quantity,
                avg_price,
                last_price,
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_fill_accounting(state: &mut PaperState, fill: &Fill) {
        let signed = fill.fill_quantity * Decimal::from(fill.side.as_i8());
        let entry = state
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| BrokerPosition {
                symbol: fill.symbol.clone(),
                signed_quantity: Decimal::ZERO,
                avg_price: fill.fill_price,
                last_price: Some(fill.fill_price),
            });
        entry.signed_quantity += signed;
        entry.last_price = Some(fill.fill_price);
        if entry.signed_quantity.is_zero() {
            state.positions.remove(&fill.symbol);
        }
    }

    fn fill_order(&self, state: &mut PaperState, order: &mut Order, quantity: Quantity) {
        let price = order
            .request
            .limit_price
            .or_else(|| state.prices.get(&order.request.symbol).copied())
            .unwrap_or(Decimal::ONE);
        order.filled_quantity += quantity;
        order.avg_fill_price = Some(price);
        order.status = if order.filled_quantity >= order.request.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.updated_at = Utc::now();
        let fill = Fill {
            order_id: order.id.clone(),
            symbol: order.request.symbol.clone(),
            side: order.request.side,
            fill_price: price,
            fill_quantity: quantity,
            fee: None,
            timestamp: order.updated_at,
        };
        Self::apply_fill_accounting(state, &fill);
        debug!(order_id = %order.id, price = %price, quantity = %quantity, "paper fill");
        let _ = self.fills.send(fill);
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            name: "paper",
            paper_trading: true,
        }
    }

    async fn connect(&self) -> BrokerResult<()> {
        info!("paper broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> BrokerResult<Price> {
        let mut state = self.lock();
        if state.fail_prices > 0 {
            state.fail_prices -= 1;
            return Err(BrokerError::Transport("price feed unavailable".into()));
        }
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::InvalidRequest(format!("no quote for {symbol}")))
    }

    async fn account_balance(&self) -> BrokerResult<Decimal> {
        let mut state = self.lock();
        if state.fail_balances > 0 {
            state.fail_balances -= 1;
            return Err(BrokerError::Transport("balance lookup failed".into()));
        }
        Ok(state.balance)
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order> {
        let mut state = self.lock();
        if state.fail_orders > 0 {
            if state.fail_orders_skip > 0 {
                state.fail_orders_skip -= 1;
            } else {
                state.fail_orders -= 1;
                return Err(BrokerError::Transport("order gateway timeout".into()));
            }
        }
        if request.quantity <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest("non-positive quantity".into()));
        }
        if request.kind == OrderKind::Limit && request.limit_price.is_none() {
            return Err(BrokerError::InvalidRequest("limit order without price".into()));
        }

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;
        state.placed.push(request.clone());
        let now = Utc::now();
        let mut order = Order {
            id: id.clone(),
            request,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            created_at: now,
            updated_at: now,
        };

        // Protective legs rest on the book until triggered; they are never
        // matched by the venue's fill behavior.
        let conditional = order.request.kind == OrderKind::StopMarket
            || order
                .request
                .client_order_id
                .as_deref()
                .is_some_and(|id| id.ends_with("-sl") || id.ends_with("-tp"));
        if conditional {
            state.orders.insert(id, order.clone());
            return Ok(order);
        }

        match state.behavior {
            FillBehavior::Immediate => {
                let quantity = order.request.quantity;
                self.fill_order(&mut state, &mut order, quantity);
            }
            FillBehavior::Never => {}
            FillBehavior::Reject => {
                order.status = OrderStatus::Rejected;
            }
            FillBehavior::Partial(numerator, denominator) => {
                let fraction =
                    Decimal::from(numerator) / Decimal::from(denominator.max(1));
                let quantity = order.request.quantity * fraction;
                if quantity > Decimal::ZERO {
                    self.fill_order(&mut state, &mut order, quantity);
                }
            }
        }

        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> BrokerResult<()> {
        let mut state = self.lock();
        let Some(order) = state.orders.get_mut(order_id) else {
            return Err(BrokerError::UnknownOrder(order_id.clone()));
        };
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &OrderId) -> BrokerResult<Option<Order>> {
        Ok(self.lock().orders.get(order_id).cloned())
    }

    async fn open_orders(&self) -> BrokerResult<Vec<Order>> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|order| !order.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Ok(self.lock().positions.values().cloned().collect())
    }

    fn fill_stream(&self) -> broadcast::Receiver<Fill> {
        self.fills.subscribe()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(symbol: &str, side: Side, quantity: Quantity) -> OrderRequest {
        OrderRequest::market(symbol, side, quantity)
    }

    #[tokio::test]
    async fn immediate_mode_fills_at_last_price() {
        let broker = PaperBroker::new();
        broker.set_price("TCS", dec!(3500));
        let mut fills = broker.fill_stream();
        let order = broker
            .place_order(market("TCS", Side::Buy, dec!(5)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(3500)));
        let fill = fills.recv().await.unwrap();
        assert_eq!(fill.fill_quantity, dec!(5));
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].signed_quantity, dec!(5));
    }

    #[tokio::test]
    async fn opposite_fills_flatten_the_broker_position() {
        let broker = PaperBroker::new();
        broker.set_price("TCS", dec!(3500));
        broker
            .place_order(market("TCS", Side::Buy, dec!(5)))
            .await
            .unwrap();
        broker
            .place_order(market("TCS", Side::Sell, dec!(5)))
            .await
            .unwrap();
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_mode_fills_the_configured_fraction() {
        let broker = PaperBroker::new();
        broker.set_price("TCS", dec!(100));
        broker.set_fill_behavior(FillBehavior::Partial(1, 4));
        let order = broker
            .place_order(market("TCS", Side::Buy, dec!(8)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(2));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let broker = PaperBroker::new();
        broker.set_price("TCS", dec!(100));
        broker.fail_next_prices(2);
        assert!(broker.last_price("TCS").await.is_err());
        assert!(broker.last_price("TCS").await.is_err());
        assert_eq!(broker.last_price("TCS").await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn cancel_marks_live_orders_only() {
        let broker = PaperBroker::new();
        broker.set_price("TCS", dec!(100));
        broker.set_fill_behavior(FillBehavior::Never);
        let order = broker
            .place_order(market("TCS", Side::Buy, dec!(1)))
            .await
            .unwrap();
        broker.cancel_order(&order.id).await.unwrap();
        let stored = broker.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(broker.cancel_order(&"missing".to_string()).await.is_err());
    }
}
