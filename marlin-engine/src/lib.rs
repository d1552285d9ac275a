//! Live engine runtime: signal gating, component wiring, background loops
//! and emergency shutdown.

mod alerts;
mod gate;
mod runtime;
mod shutdown;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use alerts::{sanitize_webhook, AlertDispatcher, FeedWatchdog};
pub use gate::{GateRejection, SignalGate, TradingCalendar, WeekdayCalendar};
pub use runtime::EngineRuntime;
pub use shutdown::ShutdownSignal;

/// Install the global tracing subscriber.
pub fn init_tracing(filter: &str) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry().with(stdout_layer).try_init()?;
    Ok(())
}
