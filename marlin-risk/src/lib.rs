//! Pre-trade risk gating and daily loss accounting.
//!
//! All counters are day-scoped in the trading venue's local time and reset
//! lazily on first access after the calendar date changes. No timer is
//! involved, so the reset also works correctly after a restart.

use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use marlin_core::{
    events::EARLY_WARNING_FRACTION, EngineEvent, EventBus, Price, Quantity, RiskLimits, Side,
};
use rust_decimal::Decimal;
use tracing::{info, warn};

/// Outcome of a pre-trade risk check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RiskVerdict {
    Allowed,
    Rejected { reason: String },
}

impl RiskVerdict {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskVerdict::Allowed)
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            RiskVerdict::Allowed => None,
            RiskVerdict::Rejected { reason } => Some(reason),
        }
    }
}

#[derive(Clone, Debug)]
struct DailyRiskState {
    date: NaiveDate,
    trades: u32,
    pnl: Price,
    early_warned: bool,
    limit_breached: bool,
}

impl DailyRiskState {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            trades: 0,
            pnl: Decimal::ZERO,
            early_warned: false,
            limit_breached: false,
        }
    }
}

/// Stateful risk gate shared by the execution pipeline.
///
/// Balance must be refreshed by the caller immediately before the final
/// risk check of an order; a stale balance must never back a risk decision.
pub struct RiskManager {
    limits: RiskLimits,
    venue_tz: Tz,
    bus: EventBus,
    state: Mutex<DailyRiskState>,
    balance: Mutex<Decimal>,
}

impl RiskManager {
    #[must_use]
    pub fn new(limits: RiskLimits, venue_tz: Tz, bus: EventBus) -> Self {
        let today = Utc::now().with_timezone(&venue_tz).date_naive();
        Self {
            limits,
            venue_tz,
            bus,
            state: Mutex::new(DailyRiskState::fresh(today)),
            balance: Mutex::new(Decimal::ZERO),
        }
    }

    fn venue_date(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.venue_tz).date_naive()
    }

    /// Run `f` against the day's counters, resetting them first if the
    /// venue-local date has rolled over since the last access.
    fn with_state<T>(&self, f: impl FnOnce(&mut DailyRiskState) -> T) -> T {
        let today = self.venue_date();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.date != today {
            info!(from = %state.date, to = %today, "resetting daily risk counters");
            *state = DailyRiskState::fresh(today);
        }
        f(&mut state)
    }

    /// Refresh the balance used by checks and sizing.
    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.lock().unwrap_or_else(|e| e.into_inner()) = balance;
    }

    #[must_use]
    pub fn balance(&self) -> Decimal {
        *self.balance.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Balance scaled by the margin multiplier when margin is enabled.
    #[must_use]
    pub fn buying_power(&self) -> Decimal {
        let balance = self.balance();
        if self.limits.margin_enabled {
            balance * self.limits.margin_multiplier
        } else {
            balance
        }
    }

    /// Absolute daily loss ceiling derived from the current balance.
    #[must_use]
    pub fn daily_loss_limit(&self) -> Price {
        self.balance() * self.limits.max_daily_loss_pct
    }

    /// Evaluate every pre-trade check in order, short-circuiting on the
    /// first failure. Reaching the daily loss ceiling additionally emits
    /// `DailyLossLimit` (once per breach) so the engine can shut down.
    pub fn check_order_risk(
        &self,
        symbol: &str,
        side: Side,
        quantity: Quantity,
        price: Price,
        stop_loss: Price,
    ) -> RiskVerdict {
        let loss_limit = self.daily_loss_limit();
        let buying_power = self.buying_power();
        let balance = self.balance();

        let trades = self.with_state(|state| state.trades);
        if trades >= self.limits.max_trades_per_day {
            return RiskVerdict::Rejected {
                reason: format!(
                    "daily trade limit reached ({trades}/{})",
                    self.limits.max_trades_per_day
                ),
            };
        }

        let (pnl, newly_breached) = self.with_state(|state| {
            let breached = loss_limit > Decimal::ZERO && state.pnl <= -loss_limit;
            let newly = breached && !state.limit_breached;
            if newly {
                state.limit_breached = true;
            }
            (state.pnl, newly)
        });

        if loss_limit > Decimal::ZERO && pnl <= -loss_limit {
            if newly_breached {
                self.bus.publish(EngineEvent::DailyLossLimit {
                    daily_pnl: pnl,
                    loss_limit,
                });
            }
            return RiskVerdict::Rejected {
                reason: format!("daily loss limit reached (pnl {pnl}, limit {loss_limit})"),
            };
        }

        let notional = price * quantity;
        let max_notional = buying_power * self.limits.position_size_pct;
        if notional > max_notional {
            return RiskVerdict::Rejected {
                reason: format!(
                    "order notional {notional} exceeds {max_notional} ({}% of buying power)",
                    self.limits.position_size_pct * Decimal::ONE_HUNDRED
                ),
            };
        }

        let risk_per_trade = (price - stop_loss).abs() * quantity;
        let max_risk = balance * self.limits.max_risk_per_trade_pct;
        if risk_per_trade > max_risk {
            return RiskVerdict::Rejected {
                reason: format!(
                    "trade risk {risk_per_trade} exceeds {max_risk} for {symbol} {side:?}"
                ),
            };
        }

        RiskVerdict::Allowed
    }

    /// Risk-based quantity: `floor(risk_budget / |entry - stop|)`, capped
    /// by the position-size ceiling converted to a share count at `entry`.
    ///
    /// Returns zero when entry equals stop (risk per share is undefined).
    #[must_use]
    pub fn position_size(
        &self,
        entry_price: Price,
        stop_loss: Price,
        max_risk_amount: Option<Price>,
    ) -> Quantity {
        if entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let per_share = (entry_price - stop_loss).abs();
        if per_share.is_zero() {
            warn!(%entry_price, "entry equals stop, risk per share undefined");
            return Decimal::ZERO;
        }
        let risk_budget =
            max_risk_amount.unwrap_or_else(|| self.balance() * self.limits.max_risk_per_trade_pct);
        let risk_qty = (risk_budget / per_share).floor();
        let cap_qty = (self.buying_power() * self.limits.position_size_pct / entry_price).floor();
        risk_qty.min(cap_qty).max(Decimal::ZERO)
    }

    /// Record a completed trade and drive the daily-loss threshold watcher.
    ///
    /// At 80% of the ceiling a non-blocking early warning is emitted; at
    /// 100% the hard-limit event fires. Each fires once per breach per day.
    pub fn record_trade(&self, realized_pnl: Price) {
        let loss_limit = self.daily_loss_limit();
        let event = self.with_state(|state| {
            state.trades += 1;
            state.pnl += realized_pnl;
            if loss_limit <= Decimal::ZERO {
                return None;
            }
            if state.pnl <= -loss_limit && !state.limit_breached {
                state.limit_breached = true;
                return Some(EngineEvent::DailyLossLimit {
                    daily_pnl: state.pnl,
                    loss_limit,
                });
            }
            if state.pnl <= -(loss_limit * EARLY_WARNING_FRACTION) && !state.early_warned {
                state.early_warned = true;
                return Some(EngineEvent::RiskWarning {
                    daily_pnl: state.pnl,
                    loss_limit,
                });
            }
            None
        });
        if let Some(event) = event {
            warn!(kind = event.kind(), "daily loss threshold crossed");
            self.bus.publish(event);
        }
    }

    #[must_use]
    pub fn trades_today(&self) -> u32 {
        self.with_state(|state| state.trades)
    }

    #[must_use]
    pub fn daily_pnl(&self) -> Price {
        self.with_state(|state| state.pnl)
    }

    #[cfg(test)]
    fn backdate(&self, date: NaiveDate) {
        self.state.lock().unwrap().date = date;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_trades_per_day: 3,
            max_daily_loss_pct: dec!(0.03),
            position_size_pct: dec!(0.25),
            max_risk_per_trade_pct: dec!(0.01),
            margin_enabled: false,
            margin_multiplier: Decimal::ONE,
        }
    }

    fn manager(bus: EventBus) -> RiskManager {
        let manager = RiskManager::new(limits(), chrono_tz::Asia::Kolkata, bus);
        manager.set_balance(dec!(10000));
        manager
    }

    #[test]
    fn allows_an_order_within_all_limits() {
        let manager = manager(EventBus::default());
        // notional 2000 <= 2500, risk 50 <= 100
        let verdict = manager.check_order_risk("TCS", Side::Buy, dec!(10), dec!(200), dec!(195));
        assert!(verdict.is_allowed());
    }

    #[test]
    fn trade_count_ceiling_is_checked_first() {
        let manager = manager(EventBus::default());
        for _ in 0..3 {
            manager.record_trade(dec!(5));
        }
        // Would also fail the notional check, but the count reason wins.
        let verdict =
            manager.check_order_risk("TCS", Side::Buy, dec!(1000), dec!(200), dec!(195));
        assert!(verdict.reason().unwrap().contains("trade limit"));
    }

    #[test]
    fn notional_ceiling_respects_margin() {
        let mut limits = limits();
        limits.margin_enabled = true;
        limits.margin_multiplier = dec!(4);
        let manager = RiskManager::new(limits, chrono_tz::Asia::Kolkata, EventBus::default());
        manager.set_balance(dec!(10000));
        // 25% of 40k buying power = 10k notional allowed.
        let verdict = manager.check_order_risk("TCS", Side::Buy, dec!(49), dec!(200), dec!(199));
        assert!(verdict.is_allowed());
        let verdict = manager.check_order_risk("TCS", Side::Buy, dec!(51), dec!(200), dec!(199));
        assert!(verdict.reason().unwrap().contains("notional"));
    }

    #[test]
    fn per_trade_risk_ceiling_rejects() {
        let manager = manager(EventBus::default());
        // risk = 15 * 10 = 150 > 100
        let verdict = manager.check_order_risk("TCS", Side::Sell, dec!(10), dec!(200), dec!(215));
        assert!(verdict.reason().unwrap().contains("trade risk"));
    }

    #[tokio::test]
    async fn daily_loss_breach_rejects_and_emits_once() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let manager = manager(bus);
        // Limit is 300; this trade breaches it via the threshold watcher.
        manager.record_trade(dec!(-300));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::DailyLossLimit { .. })
        ));
        // Subsequent checks are rejected without re-emitting.
        for _ in 0..2 {
            let verdict =
                manager.check_order_risk("TCS", Side::Buy, dec!(1), dec!(200), dec!(199));
            assert!(verdict.reason().unwrap().contains("daily loss"));
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn early_warning_fires_at_eighty_percent_once() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let manager = manager(bus);
        manager.record_trade(dec!(-240));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::RiskWarning { .. })
        ));
        manager.record_trade(dec!(-10));
        assert!(events.try_recv().is_err());
        // Crossing 100% still produces the hard-limit event.
        manager.record_trade(dec!(-60));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::DailyLossLimit { .. })
        ));
    }

    #[test]
    fn position_size_takes_the_smaller_of_risk_and_cap() {
        let manager = manager(EventBus::default());
        // risk budget 100 / 5 per share = 20; cap 2500/200 = 12.
        assert_eq!(manager.position_size(dec!(200), dec!(195), None), dec!(12));
        // Narrower stop: risk qty 100/1 = 100, cap still 12.
        assert_eq!(manager.position_size(dec!(200), dec!(199), None), dec!(12));
        // Explicit budget overrides the balance-derived one.
        assert_eq!(
            manager.position_size(dec!(200), dec!(195), Some(dec!(25))),
            dec!(5)
        );
    }

    #[test]
    fn position_size_is_zero_when_entry_equals_stop() {
        let manager = manager(EventBus::default());
        assert_eq!(manager.position_size(dec!(200), dec!(200), None), dec!(0));
    }

    #[test]
    fn counters_reset_lazily_on_date_change() {
        let manager = manager(EventBus::default());
        manager.record_trade(dec!(-50));
        assert_eq!(manager.trades_today(), 1);
        let yesterday = manager.venue_date().checked_sub_days(Days::new(1)).unwrap();
        manager.backdate(yesterday);
        // First access after the boundary resets everything.
        assert_eq!(manager.trades_today(), 0);
        assert_eq!(manager.daily_pnl(), Decimal::ZERO);
    }
}
