//! Periodic diff of internal positions against the broker's record.
//!
//! Reconciliation never corrects state: silently overwriting the book
//! could mask a bug. It reports, escalates, and leaves the decision to
//! the operator.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marlin_broker::{BrokerClient, BrokerResult};
use marlin_core::{Direction, EngineEvent, EventBus, Price, Quantity, Symbol};
use marlin_portfolio::PositionBook;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

/// A single disagreement between the book and the broker.
#[derive(Clone, Debug, PartialEq)]
pub enum Discrepancy {
    /// The broker reports a position the book does not know about.
    MissingLocally { symbol: Symbol, broker_qty: Quantity },
    /// The book tracks a position the broker no longer reports.
    MissingAtBroker { symbol: Symbol, local_qty: Quantity },
    QuantityMismatch {
        symbol: Symbol,
        local: Quantity,
        broker: Quantity,
    },
    PriceMismatch {
        symbol: Symbol,
        local: Price,
        broker: Price,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::MissingLocally { symbol, broker_qty } => {
                write!(f, "{symbol}: broker holds {broker_qty}, book has nothing")
            }
            Discrepancy::MissingAtBroker { symbol, local_qty } => {
                write!(f, "{symbol}: book holds {local_qty}, broker has nothing")
            }
            Discrepancy::QuantityMismatch {
                symbol,
                local,
                broker,
            } => write!(f, "{symbol}: quantity {local} local vs {broker} broker"),
            Discrepancy::PriceMismatch {
                symbol,
                local,
                broker,
            } => write!(f, "{symbol}: entry {local} local vs {broker} broker"),
        }
    }
}

#[derive(Default)]
struct Streak {
    consecutive: u32,
    escalated: bool,
}

/// Compares the position book with the broker's authoritative list on a
/// fixed interval and escalates persistent divergence.
pub struct Reconciler {
    broker: Arc<dyn BrokerClient>,
    book: Arc<PositionBook>,
    bus: EventBus,
    interval: Duration,
    price_tolerance: Decimal,
    escalation_threshold: u32,
    streak: Mutex<Streak>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        book: Arc<PositionBook>,
        bus: EventBus,
        interval: Duration,
        price_tolerance: Decimal,
        escalation_threshold: u32,
    ) -> Self {
        Self {
            broker,
            book,
            bus,
            interval,
            price_tolerance,
            escalation_threshold: escalation_threshold.max(1),
            streak: Mutex::new(Streak::default()),
        }
    }

    /// Cadence the owning runtime should drive this reconciler at.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One reconciliation cycle.
    ///
    /// A broker fetch failure skips the cycle without touching the streak;
    /// only an observed mismatch counts toward escalation. The critical
    /// event fires once per divergence streak, not once per cycle.
    pub async fn run_once(&self) -> BrokerResult<Vec<Discrepancy>> {
        let remote = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(error = %err, "skipping reconciliation cycle, position fetch failed");
                return Err(err);
            }
        };

        let mut broker_map: HashMap<Symbol, (Quantity, Price)> = remote
            .into_iter()
            .map(|p| (p.symbol, (p.signed_quantity, p.avg_price)))
            .collect();

        let mut discrepancies = Vec::new();
        for position in self.book.open_positions() {
            let local_signed = match position.direction {
                Direction::Long => position.quantity,
                Direction::Short => -position.quantity,
            };
            match broker_map.remove(&position.symbol) {
                None => discrepancies.push(Discrepancy::MissingAtBroker {
                    symbol: position.symbol.clone(),
                    local_qty: local_signed,
                }),
                Some((broker_signed, broker_price)) => {
                    if broker_signed != local_signed {
                        discrepancies.push(Discrepancy::QuantityMismatch {
                            symbol: position.symbol.clone(),
                            local: local_signed,
                            broker: broker_signed,
                        });
                    } else if normalized_diff(position.entry_price, broker_price)
                        > self.price_tolerance
                    {
                        discrepancies.push(Discrepancy::PriceMismatch {
                            symbol: position.symbol.clone(),
                            local: position.entry_price,
                            broker: broker_price,
                        });
                    }
                }
            }
        }
        for (symbol, (broker_signed, _)) in broker_map {
            discrepancies.push(Discrepancy::MissingLocally {
                symbol,
                broker_qty: broker_signed,
            });
        }

        self.track_streak(&discrepancies);
        Ok(discrepancies)
    }

    fn track_streak(&self, discrepancies: &[Discrepancy]) {
        let mut streak = self.streak.lock().unwrap_or_else(|e| e.into_inner());
        if discrepancies.is_empty() {
            if streak.consecutive > 0 {
                debug!("reconciliation clean, resetting mismatch streak");
            }
            *streak = Streak::default();
            return;
        }

        streak.consecutive += 1;
        let consecutive = streak.consecutive;
        warn!(
            consecutive,
            count = discrepancies.len(),
            "reconciliation mismatch"
        );
        self.bus.publish(EngineEvent::ReconciliationMismatch {
            discrepancies: discrepancies.iter().map(ToString::to_string).collect(),
            consecutive,
        });

        if consecutive >= self.escalation_threshold && !streak.escalated {
            streak.escalated = true;
            error!(
                consecutive,
                "reconciliation divergence persists, escalating to critical"
            );
            self.bus
                .publish(EngineEvent::ReconciliationCritical { consecutive });
        }
    }

    /// Current consecutive-mismatch count, exposed for diagnostics.
    #[must_use]
    pub fn consecutive_mismatches(&self) -> u32 {
        self.streak
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive
    }
}

/// Relative difference scaled to the larger magnitude, with a floor of one
/// to keep tiny reference values from exploding the ratio.
fn normalized_diff(a: Decimal, b: Decimal) -> Decimal {
    let reference = a.abs().max(b.abs()).max(Decimal::ONE);
    (a - b).abs() / reference
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marlin_core::{Fill, Side};
    use marlin_paper::PaperBroker;
    use rust_decimal_macros::dec;

    fn long_fill(symbol: &str, price: Price, quantity: Quantity) -> Fill {
        Fill {
            order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side: Side::Buy,
            fill_price: price,
            fill_quantity: quantity,
            fee: None,
            timestamp: Utc::now(),
        }
    }

    fn reconciler(
        broker: Arc<PaperBroker>,
        book: Arc<PositionBook>,
        bus: EventBus,
        threshold: u32,
    ) -> Reconciler {
        Reconciler::new(
            broker,
            book,
            bus,
            Duration::from_secs(30),
            dec!(0.001),
            threshold,
        )
    }

    #[tokio::test]
    async fn matching_state_produces_no_discrepancies() {
        let bus = EventBus::default();
        let broker = Arc::new(PaperBroker::new());
        let book = Arc::new(PositionBook::new(bus.clone()));
        book.apply_fill(&long_fill("TCS", dec!(100), dec!(10))).unwrap();
        broker.set_broker_position("TCS", dec!(10), dec!(100));

        let reconciler = reconciler(broker, book, bus, 3);
        let found = reconciler.run_once().await.unwrap();
        assert!(found.is_empty());
        assert_eq!(reconciler.consecutive_mismatches(), 0);
    }

    #[tokio::test]
    async fn detects_every_kind_of_mismatch() {
        let bus = EventBus::default();
        let broker = Arc::new(PaperBroker::new());
        let book = Arc::new(PositionBook::new(bus.clone()));
        // Quantity mismatch.
        book.apply_fill(&long_fill("TCS", dec!(100), dec!(10))).unwrap();
        broker.set_broker_position("TCS", dec!(8), dec!(100));
        // Entry price beyond tolerance.
        book.apply_fill(&long_fill("INFY", dec!(1500), dec!(5))).unwrap();
        broker.set_broker_position("INFY", dec!(5), dec!(1510));
        // Local only.
        book.apply_fill(&long_fill("SBIN", dec!(600), dec!(2))).unwrap();
        // Broker only.
        broker.set_broker_position("HDFC", dec!(3), dec!(1600));

        let reconciler = reconciler(broker, book, bus, 3);
        let found = reconciler.run_once().await.unwrap();
        assert_eq!(found.len(), 4);
        assert!(found
            .iter()
            .any(|d| matches!(d, Discrepancy::QuantityMismatch { symbol, .. } if symbol == "TCS")));
        assert!(found
            .iter()
            .any(|d| matches!(d, Discrepancy::PriceMismatch { symbol, .. } if symbol == "INFY")));
        assert!(found
            .iter()
            .any(|d| matches!(d, Discrepancy::MissingAtBroker { symbol, .. } if symbol == "SBIN")));
        assert!(found
            .iter()
            .any(|d| matches!(d, Discrepancy::MissingLocally { symbol, .. } if symbol == "HDFC")));
    }

    #[tokio::test]
    async fn escalates_exactly_once_per_divergence_streak() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let broker = Arc::new(PaperBroker::new());
        let book = Arc::new(PositionBook::new(bus.clone()));
        book.apply_fill(&long_fill("TCS", dec!(100), dec!(10))).unwrap();
        // Broker disagrees on quantity; divergence persists for 5 cycles.
        broker.set_broker_position("TCS", dec!(8), dec!(100));

        let reconciler = reconciler(broker.clone(), book, bus, 3);
        for _ in 0..5 {
            reconciler.run_once().await.unwrap();
        }

        let mut mismatches = 0;
        let mut criticals = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::ReconciliationMismatch { .. } => mismatches += 1,
                EngineEvent::ReconciliationCritical { consecutive } => {
                    criticals += 1;
                    assert_eq!(consecutive, 3);
                }
                _ => {}
            }
        }
        assert_eq!(mismatches, 5);
        assert_eq!(criticals, 1);

        // A clean cycle resets the streak and re-arms escalation.
        broker.set_broker_position("TCS", dec!(10), dec!(100));
        reconciler.run_once().await.unwrap();
        assert_eq!(reconciler.consecutive_mismatches(), 0);
        broker.set_broker_position("TCS", dec!(7), dec!(100));
        for _ in 0..3 {
            reconciler.run_once().await.unwrap();
        }
        let mut criticals_after_reset = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::ReconciliationCritical { .. }) {
                criticals_after_reset += 1;
            }
        }
        assert_eq!(criticals_after_reset, 1);
    }

    #[tokio::test]
    async fn short_positions_compare_with_signed_quantities() {
        let bus = EventBus::default();
        let broker = Arc::new(PaperBroker::new());
        let book = Arc::new(PositionBook::new(bus.clone()));
        book.apply_fill(&Fill {
            order_id: "f1".into(),
            symbol: "SBIN".into(),
            side: Side::Sell,
            fill_price: dec!(600),
            fill_quantity: dec!(4),
            fee: None,
            timestamp: Utc::now(),
        })
        .unwrap();
        broker.set_broker_position("SBIN", dec!(-4), dec!(600));

        let reconciler = reconciler(broker, book, bus, 3);
        assert!(reconciler.run_once().await.unwrap().is_empty());
    }

    #[test]
    fn normalized_diff_uses_the_larger_magnitude() {
        assert_eq!(normalized_diff(dec!(100), dec!(100)), Decimal::ZERO);
        assert!(normalized_diff(dec!(100), dec!(99)) > dec!(0.009));
        // Small references are floored at one.
        assert_eq!(normalized_diff(dec!(0.5), dec!(0.4)), dec!(0.1));
    }
}
