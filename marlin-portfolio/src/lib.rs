//! Position bookkeeping driven by the broker's trade stream.
//!
//! Fills arrive asynchronously relative to the signals that caused them, so
//! this book depends only on the fill itself plus current book state. One
//! position per symbol; a position whose quantity reaches zero is deleted.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use marlin_core::{Direction, EngineEvent, EventBus, Fill, Position, Price, Quantity, Symbol};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

/// Result alias for position-book operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("invalid fill: {0}")]
    InvalidFill(String),
}

/// What applying one fill did to the book.
#[derive(Clone, Debug, PartialEq)]
pub enum FillEffect {
    Opened,
    Increased {
        new_entry_price: Price,
    },
    Reduced {
        closed_quantity: Quantity,
        realized_pnl: Price,
    },
    Closed {
        realized_pnl: Price,
    },
}

#[derive(Default)]
struct BookState {
    positions: HashMap<Symbol, Position>,
    realized_pnl: Price,
}

/// Aggregates broker fills into one position per symbol.
pub struct PositionBook {
    state: Mutex<BookState>,
    bus: EventBus,
}

impl PositionBook {
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Mutex::new(BookState::default()),
            bus,
        }
    }

    /// Apply a fill to the book.
    ///
    /// Same-side fills grow the position and move the entry to the
    /// volume-weighted average. Opposite-side fills close
    /// `min(existing, fill)` quantity, realizing PnL; reaching zero deletes
    /// the position.
    pub fn apply_fill(&self, fill: &Fill) -> PortfolioResult<FillEffect> {
        if fill.fill_quantity <= Decimal::ZERO {
            return Err(PortfolioError::InvalidFill(format!(
                "non-positive quantity {} for {}",
                fill.fill_quantity, fill.symbol
            )));
        }
        if fill.fill_price <= Decimal::ZERO {
            return Err(PortfolioError::InvalidFill(format!(
                "non-positive price {} for {}",
                fill.fill_price, fill.symbol
            )));
        }

        let (effect, event) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            self.apply_locked(&mut state, fill)
        };
        if let Some(event) = event {
            self.bus.publish(event);
        }
        Ok(effect)
    }

    fn apply_locked(
        &self,
        state: &mut BookState,
        fill: &Fill,
    ) -> (FillEffect, Option<EngineEvent>) {
        let Some(position) = state.positions.get_mut(&fill.symbol) else {
            let direction = Direction::from_side(fill.side);
            let position = Position {
                symbol: fill.symbol.clone(),
                direction,
                quantity: fill.fill_quantity,
                entry_price: fill.fill_price,
                current_price: fill.fill_price,
                realized_pnl: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                pnl_pct: Decimal::ZERO,
                stop_loss: None,
                target: None,
                opened_at: fill.timestamp,
                updated_at: fill.timestamp,
            };
            info!(symbol = %fill.symbol, ?direction, quantity = %fill.fill_quantity, "position opened");
            state.positions.insert(fill.symbol.clone(), position);
            let event = EngineEvent::PositionOpened {
                symbol: fill.symbol.clone(),
                direction,
                quantity: fill.fill_quantity,
                entry_price: fill.fill_price,
            };
            return (FillEffect::Opened, Some(event));
        };

        if fill.side == position.direction.entry_side() {
            // Same-side add: entry becomes the volume-weighted average.
            let total = position.quantity + fill.fill_quantity;
            let prev_cost = position.entry_price * position.quantity;
            let new_cost = fill.fill_price * fill.fill_quantity;
            position.entry_price = (prev_cost + new_cost) / total;
            position.quantity = total;
            position.mark_price(fill.fill_price, fill.timestamp);
            return (
                FillEffect::Increased {
                    new_entry_price: position.entry_price,
                },
                None,
            );
        }

        // Opposite side: a closing trade for min(existing, fill).
        let closed_quantity = position.quantity.min(fill.fill_quantity);
        if fill.fill_quantity > position.quantity {
            warn!(
                symbol = %fill.symbol,
                fill_quantity = %fill.fill_quantity,
                position_quantity = %position.quantity,
                "closing fill exceeds tracked position, applying the tracked quantity"
            );
        }
        let per_unit = match position.direction {
            Direction::Long => fill.fill_price - position.entry_price,
            Direction::Short => position.entry_price - fill.fill_price,
        };
        let realized = per_unit * closed_quantity;
        state.realized_pnl += realized;
        position.realized_pnl += realized;
        position.quantity -= closed_quantity;
        position.mark_price(fill.fill_price, fill.timestamp);

        if position.quantity.is_zero() {
            let total_realized = position.realized_pnl;
            state.positions.remove(&fill.symbol);
            info!(symbol = %fill.symbol, realized = %total_realized, "position closed");
            let event = EngineEvent::PositionClosed {
                symbol: fill.symbol.clone(),
                realized_pnl: total_realized,
            };
            (FillEffect::Closed { realized_pnl: realized }, Some(event))
        } else {
            let event = EngineEvent::PositionReduced {
                symbol: fill.symbol.clone(),
                closed_quantity,
                remaining_quantity: position.quantity,
                realized_pnl: realized,
            };
            (
                FillEffect::Reduced {
                    closed_quantity,
                    realized_pnl: realized,
                },
                Some(event),
            )
        }
    }

    /// Attach protective levels to an open position so price refreshes can
    /// detect crossings.
    pub fn set_levels(&self, symbol: &str, stop_loss: Option<Price>, target: Option<Price>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(position) = state.positions.get_mut(symbol) {
            position.stop_loss = stop_loss;
            position.target = target;
        }
    }

    /// Refresh valuations against fresh quotes and emit crossing events.
    ///
    /// LONG stops trigger at price <= stop, SHORT stops at price >= stop;
    /// targets mirror that. Symbols missing from `quotes` keep their last
    /// mark.
    pub fn update_market_prices(&self, quotes: &HashMap<Symbol, Price>) {
        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for position in state.positions.values_mut() {
                let Some(price) = quotes.get(&position.symbol).copied() else {
                    continue;
                };
                position.mark_price(price, now);
                if let Some(stop) = position.stop_loss {
                    let crossed = match position.direction {
                        Direction::Long => price <= stop,
                        Direction::Short => price >= stop,
                    };
                    if crossed {
                        events.push(EngineEvent::StopLossTriggered {
                            symbol: position.symbol.clone(),
                            stop_loss: stop,
                            current_price: price,
                        });
                        continue;
                    }
                }
                if let Some(target) = position.target {
                    let reached = match position.direction {
                        Direction::Long => price >= target,
                        Direction::Short => price <= target,
                    };
                    if reached {
                        events.push(EngineEvent::TargetReached {
                            symbol: position.symbol.clone(),
                            target,
                            current_price: price,
                        });
                    }
                }
            }
        }
        for event in events {
            self.bus.publish(event);
        }
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<Position> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.positions.get(symbol).cloned()
    }

    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.positions.values().cloned().collect()
    }

    /// Realized PnL across all closed and partially closed positions.
    #[must_use]
    pub fn realized_pnl(&self) -> Price {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.realized_pnl
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marlin_core::Side;
    use rust_decimal_macros::dec;

    fn fill(symbol: &str, side: Side, price: Price, quantity: Quantity) -> Fill {
        Fill {
            order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            fill_price: price,
            fill_quantity: quantity,
            fee: None,
            timestamp: Utc::now(),
        }
    }

    fn book() -> PositionBook {
        PositionBook::new(EventBus::default())
    }

    #[test]
    fn opens_a_position_from_a_fresh_fill() {
        let book = book();
        let effect = book
            .apply_fill(&fill("TCS", Side::Buy, dec!(3500), dec!(10)))
            .unwrap();
        assert_eq!(effect, FillEffect::Opened);
        let position = book.position("TCS").unwrap();
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.entry_price, dec!(3500));
        assert_eq!(position.quantity, dec!(10));
    }

    #[test]
    fn same_side_add_moves_entry_to_exact_vwap() {
        let book = book();
        book.apply_fill(&fill("TCS", Side::Buy, dec!(100), dec!(10)))
            .unwrap();
        let effect = book
            .apply_fill(&fill("TCS", Side::Buy, dec!(110), dec!(30)))
            .unwrap();
        // (10*100 + 30*110) / 40 = 107.5 exactly
        assert_eq!(
            effect,
            FillEffect::Increased {
                new_entry_price: dec!(107.5)
            }
        );
        assert_eq!(book.position("TCS").unwrap().quantity, dec!(40));
    }

    #[test]
    fn closing_a_long_realizes_exit_minus_entry() {
        let book = book();
        book.apply_fill(&fill("INFY", Side::Buy, dec!(1500), dec!(8)))
            .unwrap();
        let effect = book
            .apply_fill(&fill("INFY", Side::Sell, dec!(1525), dec!(8)))
            .unwrap();
        assert_eq!(
            effect,
            FillEffect::Closed {
                realized_pnl: dec!(200)
            }
        );
        assert!(book.position("INFY").is_none());
        assert_eq!(book.realized_pnl(), dec!(200));
    }

    #[test]
    fn closing_a_short_realizes_entry_minus_exit() {
        let book = book();
        book.apply_fill(&fill("SBIN", Side::Sell, dec!(600), dec!(20)))
            .unwrap();
        let effect = book
            .apply_fill(&fill("SBIN", Side::Buy, dec!(590), dec!(20)))
            .unwrap();
        assert_eq!(
            effect,
            FillEffect::Closed {
                realized_pnl: dec!(200)
            }
        );
    }

    #[test]
    fn partial_close_reduces_and_keeps_entry() {
        let book = book();
        book.apply_fill(&fill("TCS", Side::Buy, dec!(100), dec!(10)))
            .unwrap();
        let effect = book
            .apply_fill(&fill("TCS", Side::Sell, dec!(105), dec!(4)))
            .unwrap();
        assert_eq!(
            effect,
            FillEffect::Reduced {
                closed_quantity: dec!(4),
                realized_pnl: dec!(20)
            }
        );
        let position = book.position("TCS").unwrap();
        assert_eq!(position.quantity, dec!(6));
        assert_eq!(position.entry_price, dec!(100));
    }

    #[test]
    fn oversized_closing_fill_is_capped_at_the_position() {
        let book = book();
        book.apply_fill(&fill("TCS", Side::Buy, dec!(100), dec!(5)))
            .unwrap();
        let effect = book
            .apply_fill(&fill("TCS", Side::Sell, dec!(102), dec!(9)))
            .unwrap();
        assert_eq!(
            effect,
            FillEffect::Closed {
                realized_pnl: dec!(10)
            }
        );
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn close_and_reduce_emit_events() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let book = PositionBook::new(bus);
        book.apply_fill(&fill("TCS", Side::Buy, dec!(100), dec!(10)))
            .unwrap();
        book.apply_fill(&fill("TCS", Side::Sell, dec!(101), dec!(4)))
            .unwrap();
        book.apply_fill(&fill("TCS", Side::Sell, dec!(101), dec!(6)))
            .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::PositionOpened { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::PositionReduced { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::PositionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn price_refresh_emits_direction_aware_crossings() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let book = PositionBook::new(bus);
        book.apply_fill(&fill("LONGY", Side::Buy, dec!(100), dec!(1)))
            .unwrap();
        book.set_levels("LONGY", Some(dec!(95)), Some(dec!(110)));
        book.apply_fill(&fill("SHORTY", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        book.set_levels("SHORTY", Some(dec!(105)), Some(dec!(90)));
        // Drain the two open events.
        let _ = events.try_recv();
        let _ = events.try_recv();

        let mut quotes = HashMap::new();
        quotes.insert("LONGY".to_string(), dec!(94));
        quotes.insert("SHORTY".to_string(), dec!(89));
        book.update_market_prices(&quotes);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&"stop_loss_triggered"));
        assert!(kinds.contains(&"target_reached"));
        // Long stop crossed, short target reached; PnL marks updated.
        assert_eq!(book.position("LONGY").unwrap().unrealized_pnl, dec!(-6));
        assert_eq!(book.position("SHORTY").unwrap().unrealized_pnl, dec!(11));
    }

    #[test]
    fn rejects_non_positive_fills() {
        let book = book();
        assert!(book
            .apply_fill(&fill("TCS", Side::Buy, dec!(100), dec!(0)))
            .is_err());
        assert!(book
            .apply_fill(&fill("TCS", Side::Buy, dec!(0), dec!(1)))
            .is_err());
    }
}
