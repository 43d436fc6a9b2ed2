//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use premia_broker::GatewayConfig;
use premia_core::SessionClock;
use premia_execution::OrderConfig;
use premia_risk::RiskConfig;
use premia_strategy::FilterConfig;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session: SessionConfig::default(),
            filter: FilterConfig::default(),
            orders: OrderConfig::default(),
            risk: RiskConfig::default(),
            feed: FeedConfig::default(),
            engine: EngineConfig::default(),
            broker: BrokerConfig::default(),
            journal: JournalConfig::default(),
            alerting: AlertingConfig::default(),
        }
    }
}

/// Session timing plus the subscription window.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub clock: SessionClock,
    #[serde(default = "default_underlying")]
    pub underlying: String,
    /// Strikes each side of the at-the-money anchor.
    #[serde(default = "default_strike_span")]
    pub strike_span: i64,
    #[serde(default = "default_strike_interval")]
    pub strike_interval: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock: SessionClock::default(),
            underlying: default_underlying(),
            strike_span: default_strike_span(),
            strike_interval: default_strike_interval(),
        }
    }
}

/// Dual-source feed supervision thresholds, in seconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeedConfig {
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_switchback_secs")]
    pub switchback_secs: u64,
    /// Both feeds silent this long: the watchdog halts trading.
    #[serde(default = "default_stale_data_timeout_secs")]
    pub stale_data_timeout_secs: u64,
    #[serde(default = "default_max_tick_age_secs")]
    pub max_tick_age_secs: u64,
    /// Fraction of the window that must stay fresh.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_secs(),
            switchback_secs: default_switchback_secs(),
            stale_data_timeout_secs: default_stale_data_timeout_secs(),
            max_tick_age_secs: default_max_tick_age_secs(),
            min_coverage: default_min_coverage(),
        }
    }
}

/// Event-loop cadences and channel sizing.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_orderbook_poll_secs")]
    pub orderbook_poll_secs: u64,
    #[serde(default = "default_position_reconcile_secs")]
    pub position_reconcile_secs: u64,
    #[serde(default = "default_risk_check_secs")]
    pub risk_check_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_tick_channel_capacity")]
    pub tick_channel_capacity: usize,
    /// Above this queue depth the engine logs saturation warnings.
    #[serde(default = "default_tick_channel_soft_limit")]
    pub tick_channel_soft_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orderbook_poll_secs: default_orderbook_poll_secs(),
            position_reconcile_secs: default_position_reconcile_secs(),
            risk_check_secs: default_risk_check_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            watchdog_secs: default_watchdog_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            tick_channel_capacity: default_tick_channel_capacity(),
            tick_channel_soft_limit: default_tick_channel_soft_limit(),
        }
    }
}

/// Primary and backup gateway endpoints.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub primary: GatewayConfig,
    #[serde(default)]
    pub backup: Option<GatewayConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
            enabled: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Startup-class alerts: at most one per this window.
    #[serde(default = "default_startup_throttle_secs")]
    pub startup_throttle_secs: u64,
    /// Feed-health alerts (failover, stale data).
    #[serde(default = "default_feed_throttle_secs")]
    pub feed_throttle_secs: u64,
    /// Broker-health alerts (rejections, outages).
    #[serde(default = "default_broker_throttle_secs")]
    pub broker_throttle_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            startup_throttle_secs: default_startup_throttle_secs(),
            feed_throttle_secs: default_feed_throttle_secs(),
            broker_throttle_secs: default_broker_throttle_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_underlying() -> String {
    "NIFTY".to_string()
}

fn default_strike_span() -> i64 {
    10
}

fn default_strike_interval() -> i64 {
    50
}

fn default_stale_secs() -> u64 {
    15
}

fn default_switchback_secs() -> u64 {
    10
}

fn default_stale_data_timeout_secs() -> u64 {
    30
}

fn default_max_tick_age_secs() -> u64 {
    60
}

fn default_min_coverage() -> f64 {
    0.5
}

fn default_orderbook_poll_secs() -> u64 {
    5
}

fn default_position_reconcile_secs() -> u64 {
    60
}

fn default_risk_check_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_watchdog_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    9
}

fn default_tick_channel_capacity() -> usize {
    4_096
}

fn default_tick_channel_soft_limit() -> usize {
    3_072
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("./reports/journal.jsonl")
}

fn default_true() -> bool {
    true
}

fn default_startup_throttle_secs() -> u64 {
    3_600
}

fn default_feed_throttle_secs() -> u64 {
    1_800
}

fn default_broker_throttle_secs() -> u64 {
    2_700
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml` (optional)
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `PREMIA_` (`__` separator)
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("PREMIA")
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
    use rust_decimal::Decimal;

    #[test]
    fn defaults_match_strategy_constants() {
        let config = AppConfig::default();
        assert_eq!(config.filter.r_value, Decimal::from(6_500));
        assert_eq!(config.filter.lot_size, 65);
        assert_eq!(config.filter.max_lots, 10);
        assert_eq!(config.risk.max_positions, 5);
        assert_eq!(config.risk.max_ce_positions, 3);
        assert_eq!(config.engine.orderbook_poll_secs, 5);
        assert_eq!(config.feed.stale_after_secs, 15);
        assert_eq!(config.feed.switchback_secs, 10);
        assert_eq!(config.engine.shutdown_timeout_secs, 9);
    }
}
