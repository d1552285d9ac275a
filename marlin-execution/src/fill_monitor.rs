//! Polling state machine that resolves every order to a terminal outcome.

use std::sync::Arc;
use std::time::Duration;

use marlin_broker::BrokerClient;
use marlin_core::{OrderStatus, Price, Quantity};
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Terminal classification of an order attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum FillOutcome {
    /// Filled in full within the deadline.
    Complete {
        filled: Quantity,
        avg_price: Price,
    },
    /// Some quantity filled when the deadline hit.
    Partial { filled: Quantity },
    /// Rejected, cancelled, or the order vanished from the broker's book.
    Failed { reason: String },
    /// Nothing filled by the deadline; the order is presumed still live.
    Timeout,
}

impl FillOutcome {
    /// Quantity actually executed, zero for `Failed`/`Timeout`.
    #[must_use]
    pub fn filled_quantity(&self) -> Quantity {
        match self {
            FillOutcome::Complete { filled, .. } | FillOutcome::Partial { filled } => *filled,
            FillOutcome::Failed { .. } | FillOutcome::Timeout => Decimal::ZERO,
        }
    }
}

/// Polls the broker for one order until a terminal outcome is reached.
///
/// The wait always resolves: rejected/cancelled/vanished orders fail
/// immediately, everything else is classified at the deadline.
#[derive(Clone)]
pub struct FillMonitor {
    broker: Arc<dyn BrokerClient>,
    poll_interval: Duration,
    deadline: Duration,
}

impl FillMonitor {
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            broker,
            poll_interval,
            deadline,
        }
    }

    pub async fn wait_for_fill(&self, order_id: &str, requested: Quantity) -> FillOutcome {
        let deadline = Instant::now() + self.deadline;
        let mut last_filled = Decimal::ZERO;
        loop {
            match self.broker.get_order(&order_id.to_string()).await {
                Ok(Some(order)) => {
                    last_filled = order.filled_quantity;
                    match order.status {
                        OrderStatus::Filled if order.filled_quantity >= requested => {
                            let avg_price = order.avg_fill_price.unwrap_or_default();
                            debug!(%order_id, %avg_price, "order filled in full");
                            return FillOutcome::Complete {
                                filled: order.filled_quantity,
                                avg_price,
                            };
                        }
                        OrderStatus::Rejected => {
                            return FillOutcome::Failed {
                                reason: format!("order {order_id} rejected by broker"),
                            };
                        }
                        OrderStatus::Cancelled => {
                            return FillOutcome::Failed {
                                reason: format!("order {order_id} cancelled"),
                            };
                        }
                        _ => {}
                    }
                }
                Ok(None) => {
                    return FillOutcome::Failed {
                        reason: format!("order {order_id} vanished from the broker's book"),
                    };
                }
                Err(err) => {
                    // Transient poll failure; keep trying until the deadline.
                    warn!(%order_id, error = %err, "fill poll failed");
                }
            }

            if Instant::now() >= deadline {
                return if last_filled > Decimal::ZERO {
                    FillOutcome::Partial {
                        filled: last_filled,
                    }
                } else {
                    FillOutcome::Timeout
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
