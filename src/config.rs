// Configuration management for the bridge trader

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::instruments::InstrumentRules;
use crate::types::Timeframe;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Unique tag for this instance; keys the persisted state file
    pub tag: String,
    /// Magic number stamped on every order so other instances' orders are ignored
    pub magic: u64,
    /// Registered strategy name (see `StrategyRegistry`)
    pub name: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    /// Hold live bars until a history batch has seeded each symbol
    #[serde(default)]
    pub preload_history: bool,
    #[serde(default)]
    pub params: toml::Table,
}

/// How a protective or profit level is placed relative to the entry price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LevelSpec {
    /// Fraction of the entry price (0.001 = 0.1%)
    PriceFraction(f64),
    /// Absolute distance in price units
    PriceDistance(f64),
    /// Distance at which the position gains/loses this fraction of equity
    EquityFraction(f64),
}

impl LevelSpec {
    pub fn value(&self) -> f64 {
        match *self {
            LevelSpec::PriceFraction(v)
            | LevelSpec::PriceDistance(v)
            | LevelSpec::EquityFraction(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Favourable move (fraction of open price) before trailing starts
    pub activation_fraction: f64,
    /// Distance of the stop behind the high-water mark (fraction of price)
    pub trail_fraction: f64,
    /// Minimum improvement (fraction of price) before a modify is sent
    #[serde(default)]
    pub step_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialStage {
    /// Favourable move (fraction of open price) that fires the stage
    pub trigger_fraction: f64,
    /// Fraction of the opening volume closed when the stage fires
    pub close_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade (0.01 = 1%)
    pub risk_per_trade: f64,
    /// Trade this many lots instead of sizing from risk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_lot: Option<f64>,
    pub stop_loss: LevelSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<LevelSpec>,
    /// Multiplier applied to the broker's stop level for a safety margin
    #[serde(default = "default_stop_level_buffer")]
    pub stop_level_buffer: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing: Option<TrailingConfig>,
    #[serde(default)]
    pub partial_take_profit: Vec<PartialStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub interval_secs: u64,
    /// Silence longer than interval × this marks the counterpart SUSPECT
    pub timeout_multiplier: f64,
    /// Silence longer than timeout × this marks the counterpart DEAD
    pub grace_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_file: Option<PathBuf>,
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_multiplier: 2.0,
            grace_multiplier: 3.0,
            heartbeat_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    pub max_age_secs: u64,
    pub refresh_timeout_ms: u64,
    /// Static rules served by the paper broker during replays
    #[serde(default)]
    pub symbols: BTreeMap<String, InstrumentRules>,
    /// Directory where the counterpart drops `<SYMBOL>.json` rules on request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_dir: Option<PathBuf>,
}

impl InstrumentsConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            refresh_timeout_ms: 2000,
            symbols: BTreeMap::new(),
            rules_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub state_dir: PathBuf,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            max_attempts: 3,
            retry_delay_ms: 50,
            io_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// A gap is flagged when bars are more than period × (1 + tolerance) apart
    pub gap_tolerance: f64,
    /// Slack allowed when checking open/close against the high/low range
    pub ohlc_tolerance: f64,
    /// How many rejected bars are remembered per symbol
    pub rejected_history: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            gap_tolerance: 0.5,
            ohlc_tolerance: 1e-9,
            rejected_history: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Dispatched actions without a confirmation after this long are dropped
    pub confirmation_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub instruments: InstrumentsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_history_bars() -> usize {
    100
}

fn default_stop_level_buffer() -> f64 {
    1.5
}

impl Default for Config {
    fn default() -> Self {
        let mut params = toml::Table::new();
        params.insert("short_period".to_string(), toml::Value::Integer(10));
        params.insert("long_period".to_string(), toml::Value::Integer(20));

        let mut symbols = BTreeMap::new();
        symbols.insert(
            "EURUSD".to_string(),
            InstrumentRules {
                min_lot: 0.01,
                max_lot: 100.0,
                lot_step: 0.01,
                stop_level: 0.0003,
                digits: 5,
                tick_value: 1.0,
            },
        );

        Self {
            strategy: StrategyConfig {
                tag: "sma-eurusd-01".to_string(),
                magic: 202402,
                name: "sma_crossover".to_string(),
                symbols: vec!["EURUSD".to_string()],
                timeframe: Timeframe::Minutes(5),
                history_bars: default_history_bars(),
                preload_history: false,
                params,
            },
            risk: RiskConfig {
                risk_per_trade: 0.005,
                fixed_lot: None,
                stop_loss: LevelSpec::PriceFraction(0.001),
                take_profit: Some(LevelSpec::PriceFraction(0.0015)),
                stop_level_buffer: default_stop_level_buffer(),
                trailing: Some(TrailingConfig {
                    activation_fraction: 0.001,
                    trail_fraction: 0.0008,
                    step_fraction: 0.0001,
                }),
                partial_take_profit: vec![PartialStage {
                    trigger_fraction: 0.001,
                    close_fraction: 0.5,
                }],
            },
            liveness: LivenessConfig {
                heartbeat_file: Some(PathBuf::from("state/heartbeat.txt")),
                ..LivenessConfig::default()
            },
            instruments: InstrumentsConfig {
                symbols,
                ..InstrumentsConfig::default()
            },
            persistence: PersistenceConfig::default(),
            data: DataConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("{}: {}", path.as_ref().display(), e)))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let strategy = &self.strategy;
        if strategy.tag.trim().is_empty() {
            return Err(ConfigError::Validation("strategy.tag must not be empty".to_string()));
        }
        if strategy
            .tag
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(ConfigError::Validation(
                "strategy.tag may only contain letters, digits, '-' and '_'".to_string(),
            ));
        }
        if strategy.symbols.is_empty() {
            return Err(ConfigError::Validation("strategy.symbols must not be empty".to_string()));
        }

        let risk = &self.risk;
        if !(risk.risk_per_trade > 0.0 && risk.risk_per_trade < 1.0) {
            return Err(ConfigError::Validation(
                "risk.risk_per_trade must be in (0, 1)".to_string(),
            ));
        }
        if let Some(lot) = risk.fixed_lot {
            if !(lot.is_finite() && lot > 0.0) {
                return Err(ConfigError::Validation("risk.fixed_lot must be positive".to_string()));
            }
        }
        if matches!(risk.stop_loss, LevelSpec::EquityFraction(_)) {
            return Err(ConfigError::Validation(
                "risk.stop_loss cannot be an equity_fraction: the stop distance drives position sizing"
                    .to_string(),
            ));
        }
        if risk.stop_loss.value() <= 0.0 {
            return Err(ConfigError::Validation("risk.stop_loss must be positive".to_string()));
        }
        if let Some(tp) = risk.take_profit {
            if tp.value() <= 0.0 {
                return Err(ConfigError::Validation("risk.take_profit must be positive".to_string()));
            }
        }
        if risk.stop_level_buffer < 1.0 {
            return Err(ConfigError::Validation(
                "risk.stop_level_buffer must be at least 1.0".to_string(),
            ));
        }
        if let Some(trailing) = &risk.trailing {
            if trailing.activation_fraction < 0.0
                || trailing.trail_fraction <= 0.0
                || trailing.step_fraction < 0.0
            {
                return Err(ConfigError::Validation(
                    "risk.trailing fractions must be non-negative (trail_fraction positive)"
                        .to_string(),
                ));
            }
        }

        let mut previous_trigger = 0.0;
        let mut total_close = 0.0;
        for (index, stage) in risk.partial_take_profit.iter().enumerate() {
            if stage.trigger_fraction <= previous_trigger {
                return Err(ConfigError::Validation(format!(
                    "risk.partial_take_profit[{}] must trigger further than the previous stage",
                    index
                )));
            }
            if !(stage.close_fraction > 0.0 && stage.close_fraction <= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "risk.partial_take_profit[{}].close_fraction must be in (0, 1]",
                    index
                )));
            }
            previous_trigger = stage.trigger_fraction;
            total_close += stage.close_fraction;
        }
        if total_close > 1.0 + 1e-9 {
            return Err(ConfigError::Validation(
                "risk.partial_take_profit close fractions sum to more than 1".to_string(),
            ));
        }

        let liveness = &self.liveness;
        if liveness.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "liveness.interval_secs must be greater than 0".to_string(),
            ));
        }
        if liveness.timeout_multiplier < 1.0 || liveness.grace_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "liveness multipliers must be at least 1.0".to_string(),
            ));
        }

        if self.instruments.refresh_timeout_ms == 0 || self.persistence.io_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "instrument refresh and persistence timeouts must be greater than 0".to_string(),
            ));
        }
        for (symbol, rules) in &self.instruments.symbols {
            rules
                .validate()
                .map_err(|reason| ConfigError::Validation(format!("instruments.symbols.{}: {}", symbol, reason)))?;
        }

        if self.persistence.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "persistence.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.data.gap_tolerance < 0.0 || self.data.ohlc_tolerance < 0.0 {
            return Err(ConfigError::Validation(
                "data tolerances must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_level_spec_toml_shape() {
        let text = r#"
            risk_per_trade = 0.01
            stop_loss = { kind = "price_distance", value = 0.005 }
            take_profit = { kind = "equity_fraction", value = 0.02 }
        "#;
        let risk: RiskConfig = toml::from_str(text).expect("risk section parses");
        assert_eq!(risk.stop_loss, LevelSpec::PriceDistance(0.005));
        assert_eq!(risk.take_profit, Some(LevelSpec::EquityFraction(0.02)));
        assert_eq!(risk.stop_level_buffer, 1.5);
        assert!(risk.partial_take_profit.is_empty());
    }

    #[test]
    fn test_rejects_unordered_partial_stages() {
        let mut config = Config::default();
        config.risk.partial_take_profit = vec![
            PartialStage {
                trigger_fraction: 0.002,
                close_fraction: 0.5,
            },
            PartialStage {
                trigger_fraction: 0.001,
                close_fraction: 0.25,
            },
        ];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_equity_fraction_stop_loss() {
        let mut config = Config::default();
        config.risk.stop_loss = LevelSpec::EquityFraction(0.01);
        assert!(config.validate().is_err());
    }
}
