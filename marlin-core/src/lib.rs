//! Core domain types shared by every marlin crate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;

pub use events::{EngineEvent, EventBus};

/// Price expressed in the quote currency.
pub type Price = Decimal;
/// Quantity of the traded instrument.
pub type Quantity = Decimal;
/// Instrument identifier as the broker knows it.
pub type Symbol = String;
/// Broker-assigned order identifier.
pub type OrderId = String;

/// Direction of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side, used when unwinding a position.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Signed unit multiplier (+1 buy, -1 sell).
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

/// Direction of an open position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Direction implied by the side that opened the position.
    #[must_use]
    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Buy => Direction::Long,
            Side::Sell => Direction::Short,
        }
    }

    /// Side that grows a position in this direction.
    #[must_use]
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side that reduces or closes a position in this direction.
    #[must_use]
    pub fn exit_side(self) -> Side {
        self.entry_side().inverse()
    }
}

/// What a strategy wants done with an instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Close,
}

impl SignalAction {
    /// Order side for entry actions; `None` for `Close`.
    #[must_use]
    pub fn side(self) -> Option<Side> {
        match self {
            SignalAction::Buy => Some(Side::Buy),
            SignalAction::Sell => Some(Side::Sell),
            SignalAction::Close => None,
        }
    }

    /// Canonical lowercase name used in idempotency keys and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Close => "close",
        }
    }
}

/// Which order mechanics the venue supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Broker-native bracket orders: one MARKET order carries the
    /// stop-loss/target legs atomically.
    Bracket,
    /// LIMIT entry near the observed price plus a client-side timeout that
    /// cancels unfilled orders; protection is placed after the fill.
    Limit,
}

/// Order mechanics requested from the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    /// Becomes a market order when the trigger price trades. Used for
    /// standalone protective stops; the trigger rides in `stop_loss`.
    StopMarket,
    /// Entry plus stop-loss/target legs placed atomically broker-side.
    Bracket,
}

/// Lifecycle state of an order as reported by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Whether the broker will never change this status again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// Everything the broker needs to route a new order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Quantity,
    /// Required for `Limit` orders, ignored otherwise.
    pub limit_price: Option<Price>,
    /// Stop-loss leg for `Bracket` orders or standalone protective stops.
    pub stop_loss: Option<Price>,
    /// Target leg for `Bracket` orders.
    pub target: Option<Price>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A plain market order with no attached legs.
    pub fn market(symbol: impl Into<Symbol>, side: Side, quantity: Quantity) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Market,
            quantity,
            limit_price: None,
            stop_loss: None,
            target: None,
            client_order_id: None,
        }
    }

    /// A protective stop that fires at `trigger`.
    pub fn stop_market(
        symbol: impl Into<Symbol>,
        side: Side,
        quantity: Quantity,
        trigger: Price,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::StopMarket,
            quantity,
            limit_price: None,
            stop_loss: Some(trigger),
            target: None,
            client_order_id: None,
        }
    }
}

/// An order as the broker reports it. The pipeline only observes these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Quantity still outstanding at the broker.
    #[must_use]
    pub fn remaining_quantity(&self) -> Quantity {
        self.request.quantity - self.filled_quantity
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_quantity >= self.request.quantity
    }
}

/// A single execution reported by the broker's trade stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub fill_price: Price,
    pub fill_quantity: Quantity,
    pub fee: Option<Price>,
    pub timestamp: DateTime<Utc>,
}

/// One open position per symbol. Deleted the moment quantity reaches zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub direction: Direction,
    pub quantity: Quantity,
    /// Volume-weighted average entry across all adds.
    pub entry_price: Price,
    pub current_price: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub pnl_pct: Decimal,
    pub stop_loss: Option<Price>,
    pub target: Option<Price>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Refresh valuation fields against a new observed price.
    pub fn mark_price(&mut self, price: Price, at: DateTime<Utc>) {
        self.current_price = price;
        let per_unit = match self.direction {
            Direction::Long => price - self.entry_price,
            Direction::Short => self.entry_price - price,
        };
        self.unrealized_pnl = per_unit * self.quantity;
        self.pnl_pct = if self.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            per_unit / self.entry_price * Decimal::ONE_HUNDRED
        };
        self.updated_at = at;
    }

    /// Notional value at the current mark.
    #[must_use]
    pub fn notional(&self) -> Price {
        self.current_price * self.quantity
    }
}

/// A strategy's request for action, consumed once per lock acquisition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: Symbol,
    pub action: SignalAction,
    pub quantity: Option<Quantity>,
    pub stop_loss: Option<Price>,
    pub target: Option<Price>,
    pub margin_multiplier: Option<Decimal>,
    pub reason: Option<String>,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(symbol: impl Into<Symbol>, action: SignalAction, confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            action,
            quantity: None,
            stop_loss: None,
            target: None,
            margin_multiplier: None,
            reason: None,
            confidence,
            generated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = Some(quantity);
        self
    }

    #[must_use]
    pub fn with_levels(mut self, stop_loss: Option<Price>, target: Option<Price>) -> Self {
        self.stop_loss = stop_loss;
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Risk configuration supplied externally; read-only to the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_trades_per_day: u32,
    /// Fraction of buying power, e.g. `0.03` for 3%.
    pub max_daily_loss_pct: Decimal,
    /// Max position notional as a fraction of buying power.
    pub position_size_pct: Decimal,
    /// Max risk (entry-to-stop distance x quantity) per trade as a fraction of balance.
    pub max_risk_per_trade_pct: Decimal,
    pub margin_enabled: bool,
    pub margin_multiplier: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_trades_per_day: 10,
            max_daily_loss_pct: Decimal::new(3, 2),
            position_size_pct: Decimal::new(25, 2),
            max_risk_per_trade_pct: Decimal::new(1, 2),
            margin_enabled: false,
            margin_multiplier: Decimal::ONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_inverse_round_trips() {
        assert_eq!(Side::Buy.inverse(), Side::Sell);
        assert_eq!(Side::Sell.inverse().inverse(), Side::Sell);
    }

    #[test]
    fn direction_exit_side_opposes_entry() {
        assert_eq!(Direction::Long.exit_side(), Side::Sell);
        assert_eq!(Direction::Short.exit_side(), Side::Buy);
    }

    #[test]
    fn mark_price_is_direction_aware() {
        let now = Utc::now();
        let mut position = Position {
            symbol: "INFY".into(),
            direction: Direction::Short,
            quantity: dec!(10),
            entry_price: dec!(1500),
            current_price: dec!(1500),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            pnl_pct: Decimal::ZERO,
            stop_loss: None,
            target: None,
            opened_at: now,
            updated_at: now,
        };
        position.mark_price(dec!(1480), now);
        assert_eq!(position.unrealized_pnl, dec!(200));
        assert!(position.pnl_pct > Decimal::ZERO);
    }

    #[test]
    fn order_remaining_quantity() {
        let request = OrderRequest::market("TCS", Side::Buy, dec!(5));
        let now = Utc::now();
        let order = Order {
            id: "ord-1".into(),
            request,
            status: OrderStatus::PartiallyFilled,
            filled_quantity: dec!(2),
            avg_fill_price: Some(dec!(3500)),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(order.remaining_quantity(), dec!(3));
        assert!(!order.is_complete());
    }
}
