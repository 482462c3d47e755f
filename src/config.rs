//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime into `SecretString`s.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::prices::retry::RetryPolicy;
use crate::types::EngineError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub invest: InvestConfig,
    #[serde(default)]
    pub prices: PricesConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// How often the scheduler polls for due iterations.
    pub poll_interval_secs: u64,
    /// Directory of the JSON store.
    pub state_dir: String,
    /// Cycle length used when a snapshot arrives without one.
    #[serde(default = "default_cycle_duration_ms")]
    pub default_cycle_duration_ms: i64,
}

fn default_cycle_duration_ms() -> i64 {
    12 * 60 * 60 * 1000
}

// ---------------------------------------------------------------------------
// Investment options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Simulated,
    Real,
}

/// Flat investment options. Keys are accepted in snake_case and in the
/// camelCase spelling used by upstream tooling.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InvestConfig {
    pub mode: TradingMode,
    pub exchange: String,
    /// Total capital under management, in USD.
    #[serde(alias = "capitalTotal")]
    pub capital_total: f64,
    /// Fraction of `capital_total` committed per cycle (0..1].
    #[serde(alias = "capitalPerCycle")]
    pub capital_per_cycle: f64,
    #[serde(alias = "maxPositions")]
    pub max_positions: usize,
    #[serde(alias = "minBoostPower")]
    pub min_boost_power: f64,
    /// Minimum predicted change, in percent.
    #[serde(alias = "minPredictedChange")]
    pub min_predicted_change: f64,
    #[serde(alias = "takeProfitPct")]
    pub take_profit_pct: f64,
    #[serde(alias = "stopLossPct")]
    pub stop_loss_pct: f64,
    #[serde(alias = "maxHoldCycles")]
    pub max_hold_cycles: u32,
    /// Exchange fee per side, in percent of notional.
    #[serde(alias = "feePct")]
    pub fee_pct: f64,
    #[serde(alias = "minSignals")]
    pub min_signals: usize,
    pub diversification: bool,
}

impl Default for InvestConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Simulated,
            exchange: "binance".to_string(),
            capital_total: 1000.0,
            capital_per_cycle: 0.3,
            max_positions: 3,
            min_boost_power: 0.35,
            min_predicted_change: 2.0,
            take_profit_pct: 10.0,
            stop_loss_pct: 5.0,
            max_hold_cycles: 24,
            fee_pct: 0.1,
            min_signals: 2,
            diversification: true,
        }
    }
}

impl InvestConfig {
    /// Reject values that would make the ledger arithmetic meaningless.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.capital_total.is_finite() && self.capital_total > 0.0) {
            return Err(EngineError::Config(format!(
                "capital_total must be positive, got {}",
                self.capital_total
            )));
        }
        if !(self.capital_per_cycle > 0.0 && self.capital_per_cycle <= 1.0) {
            return Err(EngineError::Config(format!(
                "capital_per_cycle must be in (0, 1], got {}",
                self.capital_per_cycle
            )));
        }
        if self.max_positions == 0 {
            return Err(EngineError::Config("max_positions must be at least 1".into()));
        }
        for (name, v) in [
            ("take_profit_pct", self.take_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("fee_pct", self.fee_pct),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(EngineError::Config(format!("{name} must be a non-negative number, got {v}")));
            }
        }
        Ok(())
    }

    /// Capital committed to a single cycle.
    pub fn cycle_capital(&self) -> f64 {
        self.capital_total * self.capital_per_cycle
    }

    /// Fee charged on `notional` for one side of a trade.
    pub fn fee_for(&self, notional: f64) -> f64 {
        notional * self.fee_pct / 100.0
    }
}

// ---------------------------------------------------------------------------
// Price sources
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PricesConfig {
    pub max_attempts: u32,
    /// Linear backoff step: the n-th retry waits `n × backoff_ms`.
    pub backoff_ms: u64,
    /// Per-request timeout.
    pub timeout_secs: u64,
    pub coingecko: SourceConfig,
    pub cryptocompare: SourceConfig,
    pub binance: SourceConfig,
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            timeout_secs: 8,
            coingecko: SourceConfig::enabled("https://api.coingecko.com/api/v3"),
            cryptocompare: SourceConfig::enabled("https://min-api.cryptocompare.com"),
            binance: SourceConfig::enabled("https://api.binance.com"),
        }
    }
}

impl PricesConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.max_attempts,
            Duration::from_millis(self.backoff_ms),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl SourceConfig {
    fn enabled(base_url: &str) -> Self {
        Self {
            enabled: true,
            base_url: base_url.to_string(),
            api_key_env: None,
        }
    }

    /// Resolve the configured API key, if any. A missing env var is not
    /// an error: public tiers work without a key.
    pub fn api_key(&self) -> Option<SecretString> {
        self.api_key_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .filter(|k| !k.is_empty())
            .map(SecretString::new)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key_env: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalibrationConfig {
    /// EMA smoothing factor.
    pub alpha: f64,
    pub min_samples: u32,
    /// Sample count at which corrections are applied in full.
    pub full_confidence_samples: u32,
    pub history_cap: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            min_samples: 3,
            full_confidence_samples: 20,
            history_cap: 100,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.invest.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [agent]
        name = "CYCLE-001"
        poll_interval_secs = 60
        state_dir = "state"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(cfg.agent.name, "CYCLE-001");
        assert_eq!(cfg.agent.default_cycle_duration_ms, 43_200_000);
        assert_eq!(cfg.invest.mode, TradingMode::Simulated);
        assert_eq!(cfg.invest.max_positions, 3);
        assert_eq!(cfg.prices.max_attempts, 3);
        assert!(cfg.prices.coingecko.enabled);
        assert_eq!(cfg.calibration.alpha, 0.25);
        assert_eq!(cfg.calibration.min_samples, 3);
    }

    #[test]
    fn test_invest_accepts_camel_case_keys() {
        let toml_text = format!(
            "{MINIMAL}\n[invest]\nmode = \"real\"\ncapitalTotal = 5000.0\ncapitalPerCycle = 0.5\n\
             maxPositions = 4\nminSignals = 1\nfeePct = 0.075\ndiversification = false\n"
        );
        let cfg = AppConfig::from_toml(&toml_text).unwrap();
        assert_eq!(cfg.invest.mode, TradingMode::Real);
        assert_eq!(cfg.invest.capital_total, 5000.0);
        assert_eq!(cfg.invest.max_positions, 4);
        assert_eq!(cfg.invest.min_signals, 1);
        assert!(!cfg.invest.diversification);
        // Unspecified keys keep their defaults.
        assert_eq!(cfg.invest.stop_loss_pct, 5.0);
    }

    #[test]
    fn test_invalid_capital_rejected() {
        let toml_text = format!("{MINIMAL}\n[invest]\ncapital_total = 0.0\n");
        assert!(AppConfig::from_toml(&toml_text).is_err());

        let toml_text = format!("{MINIMAL}\n[invest]\ncapital_per_cycle = 1.5\n");
        assert!(AppConfig::from_toml(&toml_text).is_err());
    }

    #[test]
    fn test_validate_rejects_negative_pct() {
        let cfg = InvestConfig {
            stop_loss_pct: -1.0,
            ..InvestConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_fee_is_percentage_of_notional() {
        let cfg = InvestConfig {
            fee_pct: 0.1,
            ..InvestConfig::default()
        };
        assert!((cfg.fee_for(300.0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_cycle_capital() {
        let cfg = InvestConfig {
            capital_total: 1000.0,
            capital_per_cycle: 0.3,
            ..InvestConfig::default()
        };
        assert!((cfg.cycle_capital() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_source_api_key_missing_env_is_none() {
        let src = SourceConfig {
            enabled: true,
            base_url: "http://localhost".into(),
            api_key_env: Some("CYCLE_ENGINE_TEST_KEY_THAT_IS_NOT_SET".into()),
        };
        assert!(src.api_key().is_none());
    }

    #[test]
    fn test_load_config_file() {
        // Requires config.toml in the working directory; tolerated if absent.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(cfg.agent.poll_interval_secs > 0);
            assert!(cfg.invest.capital_total > 0.0);
        }
    }
}
