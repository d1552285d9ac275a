//! Wires every component together and drives the background loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use marlin_broker::{BrokerClient, RetryPolicy};
use marlin_config::AppConfig;
use marlin_core::{EngineEvent, EventBus, Fill, Signal};
use marlin_execution::{ExecutionConfig, ExecutionPipeline, SignalOutcome, StopLossManager};
use marlin_guards::{IdempotencyRegistry, SymbolLocks};
use marlin_portfolio::{FillEffect, PositionBook};
use marlin_reconcile::Reconciler;
use marlin_risk::RiskManager;
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerts::{AlertDispatcher, FeedWatchdog};
use crate::gate::{SignalGate, TradingCalendar};
use crate::shutdown::ShutdownSignal;

const WATCHDOG_TICK: Duration = Duration::from_secs(30);
const SQUARE_OFF_TICK: Duration = Duration::from_secs(30);

/// Owns the full component graph and the background loops that keep it
/// consistent: fill consumption, reconciliation, price refresh, the feed
/// watchdog and auto square-off. Cloning yields a handle over the same
/// shared state.
#[derive(Clone)]
pub struct EngineRuntime {
    broker: Arc<dyn BrokerClient>,
    bus: EventBus,
    risk: Arc<RiskManager>,
    book: Arc<PositionBook>,
    stops: Arc<StopLossManager>,
    pipeline: Arc<ExecutionPipeline>,
    reconciler: Arc<Reconciler>,
    gate: Arc<SignalGate>,
    calendar: Arc<dyn TradingCalendar>,
    alerts: AlertDispatcher,
    watchdog: Arc<FeedWatchdog>,
    shutdown: ShutdownSignal,
    venue_tz: Tz,
    square_off: NaiveTime,
    price_refresh: Duration,
    squared_off_on: Arc<Mutex<Option<NaiveDate>>>,
    halted: Arc<AtomicBool>,
}

impl EngineRuntime {
    pub fn new(
        config: &AppConfig,
        broker: Arc<dyn BrokerClient>,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Result<Self> {
        let venue_tz: Tz = config
            .venue_timezone
            .parse()
            .map_err(|err| anyhow!("invalid venue timezone {}: {err}", config.venue_timezone))?;

        let bus = EventBus::default();
        let risk = Arc::new(RiskManager::new(config.risk.clone(), venue_tz, bus.clone()));
        let book = Arc::new(PositionBook::new(bus.clone()));
        let retry = RetryPolicy::new(
            config.execution.retry_attempts,
            Duration::from_millis(config.execution.retry_delay_ms),
        );
        let stops = Arc::new(StopLossManager::new(
            Arc::clone(&broker),
            bus.clone(),
            retry,
        ));
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::clone(&broker),
            Arc::clone(&risk),
            Arc::clone(&book),
            Arc::clone(&stops),
            SymbolLocks::new(Duration::from_secs(config.guards.lock_ttl_secs)),
            IdempotencyRegistry::new(Duration::from_secs(config.guards.idempotency_window_secs)),
            bus.clone(),
            ExecutionConfig {
                mode: config.mode,
                slippage_buffer: config.execution.slippage_buffer,
                default_stop_pct: config.execution.default_stop_pct,
                max_capital: config.execution.max_capital,
                limit_tolerance: config.execution.limit_tolerance,
                order_timeout: Duration::from_secs(config.execution.order_timeout_secs),
                fill_poll_interval: Duration::from_secs(config.execution.fill_poll_interval_secs),
                fill_deadline: Duration::from_secs(config.execution.fill_deadline_secs),
                retry,
            },
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&broker),
            Arc::clone(&book),
            bus.clone(),
            Duration::from_secs(config.reconciliation.interval_secs),
            config.reconciliation.price_tolerance,
            config.reconciliation.escalation_threshold,
        ));
        let gate = Arc::new(SignalGate::new(
            config.windows.clone(),
            venue_tz,
            Arc::clone(&calendar),
        ));

        Ok(Self {
            broker,
            bus,
            risk,
            book,
            stops,
            pipeline,
            reconciler,
            gate,
            calendar,
            alerts: AlertDispatcher::new(config.alerting.webhook_url.clone()),
            watchdog: Arc::new(FeedWatchdog::new(Duration::from_secs(
                config.alerting.max_data_gap_secs,
            ))),
            shutdown: ShutdownSignal::new(),
            venue_tz,
            square_off: config.windows.square_off,
            price_refresh: Duration::from_secs(config.alerting.price_refresh_secs.max(1)),
            squared_off_on: Arc::new(Mutex::new(None)),
            halted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn book(&self) -> Arc<PositionBook> {
        Arc::clone(&self.book)
    }

    pub fn risk(&self) -> Arc<RiskManager> {
        Arc::clone(&self.risk)
    }

    pub fn gate(&self) -> Arc<SignalGate> {
        Arc::clone(&self.gate)
    }

    pub fn stops(&self) -> Arc<StopLossManager> {
        Arc::clone(&self.stops)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Gate and execute one strategy signal.
    pub async fn handle_signal(&self, signal: &Signal) -> SignalOutcome {
        if let Err(rejection) = self.gate.check(signal.action, Utc::now()) {
            info!(symbol = %signal.symbol, %rejection, "signal gated");
            return SignalOutcome::Rejected {
                reason: rejection.to_string(),
            };
        }
        self.pipeline.handle_signal(signal).await
    }

    /// Fold one broker fill into the book and the daily risk counters.
    /// Entry point for the fill-stream consumer; exposed for tests.
    pub fn record_fill(&self, fill: &Fill) {
        match self.book.apply_fill(fill) {
            Ok(effect) => {
                let realized = match &effect {
                    FillEffect::Reduced { realized_pnl, .. }
                    | FillEffect::Closed { realized_pnl } => *realized_pnl,
                    FillEffect::Opened | FillEffect::Increased { .. } => Decimal::ZERO,
                };
                self.risk.record_trade(realized);
            }
            Err(err) => {
                warn!(symbol = %fill.symbol, error = %err, "fill rejected by position book");
            }
        }
    }

    /// Spawn all background loops. Handles end when shutdown triggers or
    /// their upstream channel closes.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_fill_consumer(),
            self.spawn_event_consumer(),
            self.spawn_reconciliation_loop(),
            self.spawn_price_refresh_loop(),
            self.spawn_watchdog_loop(),
            self.spawn_square_off_loop(),
        ]
    }

    /// Start the loops and block until the shutdown signal fires.
    pub async fn run_until_shutdown(&self) {
        let handles = self.start();
        self.shutdown.wait().await;
        for handle in handles {
            handle.abort();
        }
        info!("engine runtime stopped");
    }

    /// Idempotent. The first caller wins; later calls return immediately.
    pub async fn emergency_shutdown(&self, reason: &str) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(%reason, "emergency shutdown engaged");
        self.gate.engage_kill_switch();
        self.bus.publish(EngineEvent::EmergencyShutdown {
            reason: reason.to_string(),
        });

        let outcomes = self.pipeline.close_all(reason).await;
        for outcome in &outcomes {
            if !matches!(outcome, SignalOutcome::ClosedPosition { .. }) {
                warn!(?outcome, "position did not close cleanly during shutdown");
            }
        }
        self.stops.cancel_all().await;
        self.alerts.notify("Emergency shutdown", reason).await;
        self.shutdown.trigger();
    }

    fn spawn_fill_consumer(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut fills = runtime.broker.fill_stream();
        tokio::spawn(async move {
            loop {
                match fills.recv().await {
                    Ok(fill) => runtime.record_fill(&fill),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "fill consumer lagging behind the broker stream");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_event_consumer(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut events = runtime.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => runtime.handle_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event consumer lagging");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::DailyLossLimit {
                daily_pnl,
                loss_limit,
            } => {
                self.alerts
                    .notify(
                        "Daily loss limit breached",
                        &format!("daily pnl {daily_pnl} breached limit {loss_limit}"),
                    )
                    .await;
                self.emergency_shutdown("daily loss limit breached").await;
            }
            EngineEvent::RiskWarning {
                daily_pnl,
                loss_limit,
            } => {
                self.alerts
                    .notify(
                        "Daily loss warning",
                        &format!("daily pnl {daily_pnl} approaching limit {loss_limit}"),
                    )
                    .await;
            }
            EngineEvent::ReconciliationCritical { consecutive } => {
                // Divergence this persistent means the book can no longer be
                // trusted; halt signal intake. The engine's own close paths
                // bypass the gate, so positions can still be flattened.
                self.gate.engage_kill_switch();
                self.alerts
                    .notify(
                        "Reconciliation critical",
                        &format!(
                            "{consecutive} consecutive mismatched cycles, signal intake halted"
                        ),
                    )
                    .await;
            }
            EngineEvent::PositionClosed { symbol, .. } => {
                // A stop or target execution flattens the position without
                // going through the explicit close path; cancel whichever
                // protective leg survived.
                self.stops.release(&symbol).await;
            }
            EngineEvent::ReconciliationMismatch {
                discrepancies,
                consecutive,
            } => {
                warn!(consecutive, ?discrepancies, "broker state mismatch");
            }
            EngineEvent::ProtectionFailed { symbol, detail } => {
                self.alerts
                    .notify("Protective order failure", &format!("{symbol}: {detail}"))
                    .await;
            }
            EngineEvent::StopLossTriggered {
                symbol,
                stop_loss,
                current_price,
            } => {
                info!(%symbol, %stop_loss, %current_price, "stop loss level crossed");
            }
            EngineEvent::TargetReached {
                symbol,
                target,
                current_price,
            } => {
                info!(%symbol, %target, %current_price, "target level crossed");
            }
            other => {
                info!(kind = other.kind(), "engine event");
            }
        }
    }

    fn spawn_reconciliation_loop(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let interval = runtime.reconciler.interval();
            while runtime.shutdown.sleep(interval).await {
                if let Err(err) = runtime.reconciler.run_once().await {
                    warn!(error = %err, "reconciliation cycle skipped");
                }
            }
        })
    }

    fn spawn_price_refresh_loop(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            while runtime.shutdown.sleep(runtime.price_refresh).await {
                let positions = runtime.book.open_positions();
                if positions.is_empty() {
                    // Nothing to mark; an idle book is not a dead feed.
                    runtime.watchdog.heartbeat();
                    continue;
                }
                let mut quotes = HashMap::new();
                for position in positions {
                    match runtime.broker.last_price(&position.symbol).await {
                        Ok(price) => {
                            quotes.insert(position.symbol.clone(), price);
                        }
                        Err(err) => {
                            warn!(symbol = %position.symbol, error = %err, "price refresh failed");
                        }
                    }
                }
                if !quotes.is_empty() {
                    runtime.watchdog.heartbeat();
                    runtime.book.update_market_prices(&quotes);
                }
            }
        })
    }

    fn spawn_watchdog_loop(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            while runtime.shutdown.sleep(WATCHDOG_TICK).await {
                if runtime.watchdog.stalled() {
                    runtime
                        .alerts
                        .notify(
                            "Market data stalled",
                            "no price data inside the configured gap",
                        )
                        .await;
                    runtime.emergency_shutdown("dead market data feed").await;
                }
            }
        })
    }

    /// Whether the square-off tick should fire at the venue-local `now`:
    /// a trading day, past the cutoff, and not already done that date.
    /// Marks the date done when it returns true.
    pub fn square_off_due(&self, now: DateTime<Tz>) -> bool {
        let today = now.date_naive();
        if !self.calendar.is_trading_day(today) || now.time() < self.square_off {
            return false;
        }
        let mut done = self
            .squared_off_on
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *done == Some(today) {
            return false;
        }
        *done = Some(today);
        true
    }

    fn spawn_square_off_loop(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            while runtime.shutdown.sleep(SQUARE_OFF_TICK).await {
                let local = Utc::now().with_timezone(&runtime.venue_tz);
                if !runtime.square_off_due(local) {
                    continue;
                }
                if runtime.book.open_positions().is_empty() {
                    continue;
                }
                info!("auto square-off cutoff reached, flattening the book");
                runtime.pipeline.close_all("auto square-off").await;
                runtime.stops.cancel_all().await;
            }
        })
    }
}
