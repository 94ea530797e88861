//! Configuration surface.
//!
//! No config-file bootstrap: this builds one `Config` struct from
//! environment variables with a default for every field, using the
//! same `std::env::var(...).unwrap_or(...)`/parse-with-fallback idiom
//! throughout instead of ad hoc globals.

use std::time::Duration;

use crate::circuit_breaker::ProtectionConfig;
use crate::error::ConfigError;
use crate::monitor::MonitorConfig;
use crate::types::DesiredSignal;

#[derive(Debug, Clone)]
pub struct Config {
    pub bridge_host: String,
    pub bridge_port: u16,
    pub symbol: String,
    /// `symbols.priority_list`: accepted symbol aliases, tried in order;
    /// the first one the EA actually reports is the one tracked for the
    /// life of the process. Always includes `symbol` itself even if the
    /// env var is unset or omits it, since the primary symbol must always
    /// be an accepted alias of itself.
    pub symbol_aliases: Vec<String>,
    pub timeframe: String,
    pub risk_percentage: f64,
    pub desired_signal: DesiredSignal,
    pub sar_acceleration: f64,
    pub sar_maximum: f64,
    pub logs_dir: String,
    pub daily_loss_max_percentage: f64,
    pub daily_loss_max_dollars: f64,
    pub daily_loss_use_percentage: bool,
    pub tier1_threshold: u32,
    pub tier1_pause_hours: i64,
    pub tier2_threshold: u32,
    pub tier2_pause_hours: i64,
    pub rolling_window: usize,
    pub rolling_loss_rate_threshold: f64,
    pub rolling_pause_hours: i64,
    pub tick_max_age_secs: u64,
    pub account_max_age_secs: u64,
    pub min_trail_step_points: f64,
    pub emergency_buffer_points: f64,
    pub signal_check_interval_secs: u64,
    pub position_check_interval_secs: u64,
    pub position_stale_after_secs: u64,
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let symbol = env_string("SYMBOL", "XAUUSD");
        let symbol_aliases = env_symbol_aliases("SYMBOLS_PRIORITY_LIST", &symbol);
        let cfg = Config {
            bridge_host: env_string("BRIDGE_HOST", "127.0.0.1"),
            bridge_port: env_parse("BRIDGE_PORT", 9090)?,
            symbol,
            symbol_aliases,
            timeframe: env_string("SAR_TIMEFRAME", "M15"),
            risk_percentage: env_parse("RISK_PERCENTAGE", 1.0)?,
            desired_signal: env_desired_signal("DESIRED_SIGNAL", DesiredSignal::Both)?,
            sar_acceleration: env_parse("SAR_ACCELERATION", crate::sar::DEFAULT_ACCELERATION)?,
            sar_maximum: env_parse("SAR_MAXIMUM", crate::sar::DEFAULT_MAXIMUM)?,
            logs_dir: env_string("LOGS_DIR", "./data"),
            daily_loss_max_percentage: env_parse("DAILY_LOSS_MAX_PERCENTAGE", 10.0)?,
            daily_loss_max_dollars: env_parse("DAILY_LOSS_MAX_DOLLARS", 1_000.0)?,
            daily_loss_use_percentage: env_bool("DAILY_LOSS_USE_PERCENTAGE", true)?,
            tier1_threshold: env_parse("TIER1_LOSS_THRESHOLD", 5)?,
            tier1_pause_hours: env_parse("TIER1_PAUSE_HOURS", 3)?,
            tier2_threshold: env_parse("TIER2_LOSS_THRESHOLD", 8)?,
            tier2_pause_hours: env_parse("TIER2_PAUSE_HOURS", 5)?,
            rolling_window: env_parse("ROLLING_WINDOW", 10)?,
            rolling_loss_rate_threshold: env_parse("ROLLING_LOSS_RATE_THRESHOLD", 0.7)?,
            rolling_pause_hours: env_parse("ROLLING_PAUSE_HOURS", 5)?,
            tick_max_age_secs: env_parse("TICK_MAX_AGE_SECS", 30)?,
            account_max_age_secs: env_parse("ACCOUNT_MAX_AGE_SECS", 30)?,
            min_trail_step_points: env_parse("MIN_TRAIL_STEP_POINTS", 1.0)?,
            emergency_buffer_points: env_parse("EMERGENCY_BUFFER_POINTS", 0.0)?,
            signal_check_interval_secs: env_parse("SIGNAL_CHECK_INTERVAL_SECS", 30)?,
            position_check_interval_secs: env_parse("POSITION_CHECK_INTERVAL_SECS", 5)?,
            position_stale_after_secs: env_parse("POSITION_STALE_AFTER_SECS", 20)?,
            webhook_url: std::env::var("NOTIFY_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.risk_percentage <= 0.0 || self.risk_percentage > 100.0 {
            return Err(ConfigError::Invalid { field: "RISK_PERCENTAGE", reason: "must be in (0, 100]".to_string() });
        }
        if self.sar_acceleration <= 0.0 || self.sar_acceleration > self.sar_maximum {
            return Err(ConfigError::Invalid {
                field: "SAR_ACCELERATION",
                reason: "must be positive and not exceed SAR_MAXIMUM".to_string(),
            });
        }
        if self.tier1_threshold >= self.tier2_threshold {
            return Err(ConfigError::Invalid {
                field: "TIER1_LOSS_THRESHOLD",
                reason: "must be strictly less than TIER2_LOSS_THRESHOLD".to_string(),
            });
        }
        Ok(())
    }

    pub fn protection_config(&self) -> ProtectionConfig {
        ProtectionConfig {
            daily_loss_enabled: true,
            max_daily_loss_percentage: self.daily_loss_max_percentage,
            max_daily_loss_dollars: self.daily_loss_max_dollars,
            use_percentage: self.daily_loss_use_percentage,
            tier1_threshold: self.tier1_threshold,
            tier1_pause: chrono::Duration::hours(self.tier1_pause_hours),
            tier2_threshold: self.tier2_threshold,
            tier2_pause: chrono::Duration::hours(self.tier2_pause_hours),
            rolling_window: self.rolling_window,
            rolling_loss_rate_threshold: self.rolling_loss_rate_threshold,
            rolling_pause: chrono::Duration::hours(self.rolling_pause_hours),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            min_trail_step_points: self.min_trail_step_points,
            emergency_buffer_points: self.emergency_buffer_points,
        }
    }

    pub fn tick_max_age(&self) -> Duration {
        Duration::from_secs(self.tick_max_age_secs)
    }

    pub fn account_max_age(&self) -> Duration {
        Duration::from_secs(self.account_max_age_secs)
    }

    pub fn position_stale_after(&self) -> Duration {
        Duration::from_secs(self.position_stale_after_secs)
    }

    pub fn signal_check_interval(&self) -> Duration {
        Duration::from_secs(self.signal_check_interval_secs)
    }

    pub fn position_check_interval(&self) -> Duration {
        Duration::from_secs(self.position_check_interval_secs)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { field: key, reason: format!("could not parse {raw:?}") }),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { field: key, reason: format!("could not parse {raw:?} as bool") }),
        },
        Err(_) => Ok(default),
    }
}

/// Parses a comma-separated `symbols.priority_list`, trimming whitespace
/// and dropping empty entries. `primary` is always included (prepended if
/// missing) so the main symbol is never rejected as an unrecognized alias.
fn env_symbol_aliases(key: &str, primary: &str) -> Vec<String> {
    let mut aliases: Vec<String> = std::env::var(key)
        .ok()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if !aliases.iter().any(|a| a.eq_ignore_ascii_case(primary)) {
        aliases.insert(0, primary.to_string());
    }
    aliases
}

fn env_desired_signal(key: &'static str, default: DesiredSignal) -> Result<DesiredSignal, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_uppercase().as_str() {
            "BUY" => Ok(DesiredSignal::Buy),
            "SELL" => Ok(DesiredSignal::Sell),
            "BOTH" => Ok(DesiredSignal::Both),
            _ => Err(ConfigError::Invalid { field: key, reason: format!("expected BUY/SELL/BOTH, got {raw:?}") }),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_validate_cleanly() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "RISK_PERCENTAGE", "SAR_ACCELERATION", "SAR_MAXIMUM", "TIER1_LOSS_THRESHOLD",
            "TIER2_LOSS_THRESHOLD", "SYMBOLS_PRIORITY_LIST",
        ] {
            std::env::remove_var(key);
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.symbol, "XAUUSD");
        assert_eq!(cfg.tier1_threshold, 5);
        assert_eq!(cfg.symbol_aliases, vec!["XAUUSD".to_string()]);
    }

    #[test]
    fn symbol_priority_list_always_includes_primary_symbol() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SYMBOLS_PRIORITY_LIST", "GOLD, XAUUSD.m");
        let cfg = Config::from_env().unwrap();
        std::env::remove_var("SYMBOLS_PRIORITY_LIST");
        assert_eq!(cfg.symbol_aliases, vec!["XAUUSD".to_string(), "GOLD".to_string(), "XAUUSD.m".to_string()]);
    }

    #[test]
    fn invalid_risk_percentage_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("RISK_PERCENTAGE", "150");
        let result = Config::from_env();
        std::env::remove_var("RISK_PERCENTAGE");
        assert!(matches!(result, Err(ConfigError::Invalid { field: "RISK_PERCENTAGE", .. })));
    }

    #[test]
    fn tier_ordering_is_enforced() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TIER1_LOSS_THRESHOLD", "9");
        std::env::set_var("TIER2_LOSS_THRESHOLD", "8");
        let result = Config::from_env();
        std::env::remove_var("TIER1_LOSS_THRESHOLD");
        std::env::remove_var("TIER2_LOSS_THRESHOLD");
        assert!(result.is_err());
    }
}
