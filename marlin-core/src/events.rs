//! Typed broadcast bus wiring the pipeline's components together.

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{Direction, OrderId, Price, Quantity, Side, Symbol};

/// Events published by the pipeline. Payloads are owned so subscribers
/// never borrow engine state.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    TradeExecuted {
        symbol: Symbol,
        side: Side,
        quantity: Quantity,
        price: Price,
        order_id: OrderId,
    },
    PositionOpened {
        symbol: Symbol,
        direction: Direction,
        quantity: Quantity,
        entry_price: Price,
    },
    PositionReduced {
        symbol: Symbol,
        closed_quantity: Quantity,
        remaining_quantity: Quantity,
        realized_pnl: Price,
    },
    PositionClosed {
        symbol: Symbol,
        realized_pnl: Price,
    },
    StopLossTriggered {
        symbol: Symbol,
        stop_loss: Price,
        current_price: Price,
    },
    TargetReached {
        symbol: Symbol,
        target: Price,
        current_price: Price,
    },
    /// Daily loss has reached the early-warning fraction of the ceiling.
    RiskWarning {
        daily_pnl: Price,
        loss_limit: Price,
    },
    /// Daily loss ceiling met or exceeded. Emitted once per breach.
    DailyLossLimit {
        daily_pnl: Price,
        loss_limit: Price,
    },
    ReconciliationMismatch {
        discrepancies: Vec<String>,
        consecutive: u32,
    },
    /// Internal and broker state may have diverged unrecoverably.
    ReconciliationCritical {
        consecutive: u32,
    },
    EmergencyShutdown {
        reason: String,
    },
    ProtectionFailed {
        symbol: Symbol,
        detail: String,
    },
}

impl EngineEvent {
    /// Short name used in logs and notification titles.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::TradeExecuted { .. } => "trade_executed",
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionReduced { .. } => "position_reduced",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::StopLossTriggered { .. } => "stop_loss_triggered",
            EngineEvent::TargetReached { .. } => "target_reached",
            EngineEvent::RiskWarning { .. } => "risk_warning",
            EngineEvent::DailyLossLimit { .. } => "daily_loss_limit",
            EngineEvent::ReconciliationMismatch { .. } => "reconciliation_mismatch",
            EngineEvent::ReconciliationCritical { .. } => "reconciliation_critical",
            EngineEvent::EmergencyShutdown { .. } => "emergency_shutdown",
            EngineEvent::ProtectionFailed { .. } => "protection_failed",
        }
    }
}

/// Cloneable handle over a bounded broadcast channel.
///
/// Publishing never blocks; with no live subscribers the event is dropped,
/// which is fine because every consumer that matters subscribes at startup.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        trace!(kind = event.kind(), "publishing engine event");
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers, used by tests and diagnostics.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Convenience alias so callers can name the loss-limit fraction in one place.
pub const EARLY_WARNING_FRACTION: Decimal = Decimal::from_parts(8, 0, 0, false, 1);

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn early_warning_fraction_is_eighty_percent() {
        assert_eq!(EARLY_WARNING_FRACTION, dec!(0.8));
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(EngineEvent::EmergencyShutdown {
            reason: "drill".into(),
        });
        assert!(matches!(
            first.recv().await,
            Ok(EngineEvent::EmergencyShutdown { .. })
        ));
        assert!(matches!(
            second.recv().await,
            Ok(EngineEvent::EmergencyShutdown { .. })
        ));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::RiskWarning {
            daily_pnl: dec!(-240),
            loss_limit: dec!(300),
        });
    }
}
