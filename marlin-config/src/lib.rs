//! Layered configuration loading utilities.

use std::path::Path;

use anyhow::Result;
use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use marlin_core::{RiskLimits, TradingMode};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// IANA timezone of the trading venue; daily resets and trading
    /// windows are evaluated in this zone.
    #[serde(default = "default_venue_timezone")]
    pub venue_timezone: String,
    #[serde(default = "default_mode")]
    pub mode: TradingMode,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub guards: GuardSettings,
    #[serde(default)]
    pub reconciliation: ReconciliationSettings,
    #[serde(default)]
    pub alerting: AlertingSettings,
    #[serde(default)]
    pub windows: WindowSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionSettings {
    #[serde(default = "default_slippage_buffer")]
    pub slippage_buffer: Decimal,
    #[serde(default = "default_stop_pct")]
    pub default_stop_pct: Decimal,
    #[serde(default = "default_max_capital")]
    pub max_capital: Decimal,
    #[serde(default = "default_limit_tolerance")]
    pub limit_tolerance: Decimal,
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_fill_poll_interval_secs")]
    pub fill_poll_interval_secs: u64,
    #[serde(default = "default_fill_deadline_secs")]
    pub fill_deadline_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardSettings {
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_idempotency_window_secs")]
    pub idempotency_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationSettings {
    #[serde(default = "default_reconciliation_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: Decimal,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertingSettings {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Zero disables the dead-feed watchdog.
    #[serde(default = "default_max_data_gap_secs")]
    pub max_data_gap_secs: u64,
    #[serde(default = "default_price_refresh_secs")]
    pub price_refresh_secs: u64,
}

/// Daily trading windows in venue-local time.
#[derive(Debug, Deserialize, Clone)]
pub struct WindowSettings {
    #[serde(default = "default_data_open")]
    pub data_open: NaiveTime,
    #[serde(default = "default_data_close")]
    pub data_close: NaiveTime,
    #[serde(default = "default_signal_open")]
    pub signal_open: NaiveTime,
    #[serde(default = "default_signal_close")]
    pub signal_close: NaiveTime,
    #[serde(default = "default_square_off")]
    pub square_off: NaiveTime,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            slippage_buffer: default_slippage_buffer(),
            default_stop_pct: default_stop_pct(),
            max_capital: default_max_capital(),
            limit_tolerance: default_limit_tolerance(),
            order_timeout_secs: default_order_timeout_secs(),
            fill_poll_interval_secs: default_fill_poll_interval_secs(),
            fill_deadline_secs: default_fill_deadline_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            idempotency_window_secs: default_idempotency_window_secs(),
        }
    }
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reconciliation_interval_secs(),
            price_tolerance: default_price_tolerance(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_data_gap_secs: default_max_data_gap_secs(),
            price_refresh_secs: default_price_refresh_secs(),
        }
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            data_open: default_data_open(),
            data_close: default_data_close(),
            signal_open: default_signal_open(),
            signal_close: default_signal_close(),
            square_off: default_square_off(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_venue_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_mode() -> TradingMode {
    TradingMode::Limit
}

fn default_slippage_buffer() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_stop_pct() -> Decimal {
    Decimal::new(1, 2)
}

fn default_max_capital() -> Decimal {
    Decimal::from(100_000u32)
}

fn default_limit_tolerance() -> Decimal {
    Decimal::new(1, 3)
}

fn default_order_timeout_secs() -> u64 {
    20
}

fn default_fill_poll_interval_secs() -> u64 {
    2
}

fn default_fill_deadline_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_lock_ttl_secs() -> u64 {
    5
}

fn default_idempotency_window_secs() -> u64 {
    300
}

fn default_reconciliation_interval_secs() -> u64 {
    30
}

fn default_price_tolerance() -> Decimal {
    Decimal::new(1, 3)
}

fn default_escalation_threshold() -> u32 {
    3
}

fn default_max_data_gap_secs() -> u64 {
    300
}

fn default_price_refresh_secs() -> u64 {
    5
}

fn hms(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn default_data_open() -> NaiveTime {
    hms(9, 0)
}

fn default_data_close() -> NaiveTime {
    hms(15, 30)
}

fn default_signal_open() -> NaiveTime {
    hms(9, 20)
}

fn default_signal_close() -> NaiveTime {
    hms(15, 0)
}

fn default_square_off() -> NaiveTime {
    hms(15, 15)
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `MARLIN_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("MARLIN")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_cover_every_section() {
        let settings = ExecutionSettings::default();
        assert_eq!(settings.slippage_buffer, dec!(0.001));
        assert_eq!(settings.fill_poll_interval_secs, 2);
        assert_eq!(settings.fill_deadline_secs, 30);
        assert_eq!(GuardSettings::default().lock_ttl_secs, 5);
        assert_eq!(ReconciliationSettings::default().interval_secs, 30);
        assert_eq!(WindowSettings::default().square_off, hms(15, 15));
    }

    #[test]
    fn app_config_deserializes_from_empty_input() {
        let config = Config::builder().build().unwrap();
        let app: AppConfig = config.try_deserialize().unwrap();
        assert_eq!(app.mode, TradingMode::Limit);
        assert_eq!(app.risk.max_trades_per_day, 10);
        assert_eq!(app.venue_timezone, "Asia/Kolkata");
    }
}
