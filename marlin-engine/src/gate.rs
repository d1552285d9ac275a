//! Kill-switch and venue-calendar gating applied before the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use marlin_config::WindowSettings;
use marlin_core::SignalAction;
use thiserror::Error;

/// Why the gate turned a signal away. Pure verdicts, no side effects.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateRejection {
    #[error("kill switch engaged, signal processing halted")]
    KillSwitch,
    #[error("{0} is not a trading day")]
    NonTradingDay(NaiveDate),
    #[error("outside the market data window")]
    OutsideDataWindow,
    #[error("outside the signal entry window")]
    OutsideSignalWindow,
    #[error("past the auto square-off cutoff")]
    PastSquareOff,
}

/// Which venue-local dates trading happens on.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Monday-to-Friday calendar with no holiday awareness.
pub struct WeekdayCalendar;

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Rejects signals that arrive outside the configured trading windows or
/// while the kill switch is engaged. The kill switch halts every action;
/// CLOSE signals only ever reduce risk, so below it they pass whenever
/// the market data window is open.
pub struct SignalGate {
    kill_switch: AtomicBool,
    calendar: Arc<dyn TradingCalendar>,
    windows: WindowSettings,
    venue_tz: Tz,
}

impl SignalGate {
    pub fn new(windows: WindowSettings, venue_tz: Tz, calendar: Arc<dyn TradingCalendar>) -> Self {
        Self {
            kill_switch: AtomicBool::new(false),
            calendar,
            windows,
            venue_tz,
        }
    }

    pub fn engage_kill_switch(&self) {
        self.kill_switch.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    /// Decide whether a signal may proceed at `now`.
    pub fn check(&self, action: SignalAction, now: DateTime<Utc>) -> Result<(), GateRejection> {
        let local = now.with_timezone(&self.venue_tz);
        let date = local.date_naive();
        let time = local.time();

        if self.kill_switch_engaged() {
            return Err(GateRejection::KillSwitch);
        }
        if !self.calendar.is_trading_day(date) {
            return Err(GateRejection::NonTradingDay(date));
        }
        if time < self.windows.data_open || time >= self.windows.data_close {
            return Err(GateRejection::OutsideDataWindow);
        }
        if action == SignalAction::Close {
            return Ok(());
        }
        if time >= self.windows.square_off {
            return Err(GateRejection::PastSquareOff);
        }
        if time < self.windows.signal_open || time >= self.windows.signal_close {
            return Err(GateRejection::OutsideSignalWindow);
        }
        Ok(())
    }
}
