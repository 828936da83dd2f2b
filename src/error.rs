//! Unified error handling for the bridge trader
//!
//! Every fallible operation in the crate returns [`TradingResult`]. The
//! variants follow the operational taxonomy the trade manager reacts to:
//! validation problems are dropped and logged, broker rejections leave
//! state untouched, staleness triggers a refresh, persistence failures are
//! retried and may halt new order dispatch.

use std::io;

use thiserror::Error;

/// Main error type for the bridge trader
#[derive(Debug, Error)]
pub enum TradingError {
    // Configuration errors
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    // Validation errors
    #[error("Invalid parameter '{0}': {1}")]
    InvalidParameter(String, String),

    #[error("Computed volume {computed:.4} is below the minimum lot {min_lot}")]
    BelowMinimumLot { computed: f64, min_lot: f64 },

    // Strategy errors
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Invalid strategy parameters for '{strategy}': {reason}")]
    StrategyParams { strategy: String, reason: String },

    // Broker errors
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Failed to dispatch order action: {0}")]
    DispatchFailed(String),

    // Staleness errors
    #[error("Instrument rules unavailable for {symbol}: {reason}")]
    InstrumentRulesUnavailable { symbol: String, reason: String },

    #[error("Instrument refresh timed out for {0}")]
    InstrumentRefreshTimeout(String),

    // Persistence errors
    #[error("Persistence I/O error: {0}")]
    PersistenceIo(String),

    #[error("Persistence timed out after {0} ms")]
    PersistenceTimeout(u64),

    #[error("Persisted state is corrupt: {0}")]
    StateCorrupt(String),

    #[error("New orders halted: {0}")]
    OpensHalted(String),

    // Liveness errors
    #[error("Counterpart is not responding: {0}")]
    CounterpartDead(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::ConfigNotFound(path) => {
                format!(
                    "Configuration file not found: {}\n\n\
                    💡 Quick fix:\n\
                    1. Run: bridge-bot init\n\
                    2. Edit config.toml (tag, magic number, symbols)\n\
                    3. Try again",
                    path
                )
            }
            TradingError::StrategyNotFound(name) => {
                format!(
                    "Strategy not found: {}\n\n\
                    💡 Run: bridge-bot check  (lists the registered strategies)",
                    name
                )
            }
            TradingError::StateCorrupt(msg) => {
                format!(
                    "Persisted state is corrupt: {}\n\n\
                    💡 New orders stay halted until the state file is repaired or removed.\n\
                    Inspect it with: bridge-bot state",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::PersistenceIo(_)
                | TradingError::PersistenceTimeout(_)
                | TradingError::InstrumentRefreshTimeout(_)
                | TradingError::DispatchFailed(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_) => "config",

            TradingError::InvalidParameter(_, _)
            | TradingError::BelowMinimumLot { .. } => "validation",

            TradingError::StrategyNotFound(_) | TradingError::StrategyParams { .. } => "strategy",

            TradingError::OrderRejected { .. } | TradingError::DispatchFailed(_) => "broker",

            TradingError::InstrumentRulesUnavailable { .. }
            | TradingError::InstrumentRefreshTimeout(_) => "staleness",

            TradingError::PersistenceIo(_)
            | TradingError::PersistenceTimeout(_)
            | TradingError::StateCorrupt(_)
            | TradingError::OpensHalted(_) => "persistence",

            TradingError::CounterpartDead(_) => "liveness",

            TradingError::Internal(_) => "internal",
        }
    }
}

// Conversion implementations for common error types

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        TradingError::PersistenceIo(err.to_string())
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::StateCorrupt(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigParse(format!("TOML parse error: {}", err))
    }
}

impl From<crate::config::ConfigError> for TradingError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::FileRead(msg) => TradingError::ConfigNotFound(msg),
            ConfigError::FileWrite(msg) => TradingError::PersistenceIo(msg),
            ConfigError::Parse(msg) => TradingError::ConfigParse(msg),
            ConfigError::Serialize(msg) => TradingError::ConfigParse(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
        }
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TradingError::BelowMinimumLot {
            computed: 0.004,
            min_lot: 0.01,
        };
        let text = err.to_string();
        assert!(text.contains("0.0040"));
        assert!(text.contains("0.01"));
    }

    #[test]
    fn test_error_category() {
        let err = TradingError::ConfigValidation("test".to_string());
        assert_eq!(err.category(), "config");

        let err = TradingError::PersistenceTimeout(500);
        assert_eq!(err.category(), "persistence");

        let err = TradingError::OrderRejected {
            reason: "no money".to_string(),
        };
        assert_eq!(err.category(), "broker");
    }

    #[test]
    fn test_retryable() {
        assert!(TradingError::PersistenceIo("disk".to_string()).is_retryable());
        assert!(!TradingError::StateCorrupt("bad json".to_string()).is_retryable());
        assert!(!TradingError::ConfigNotFound("x".to_string()).is_retryable());
    }

    #[test]
    fn test_user_message() {
        let err = TradingError::ConfigNotFound("config.toml".to_string());
        let msg = err.user_message();
        assert!(msg.contains("bridge-bot init"));
        assert!(msg.contains("💡"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "read only");
        let trading_err: TradingError = io_err.into();
        assert!(matches!(trading_err, TradingError::PersistenceIo(_)));
        assert!(trading_err.is_retryable());
    }
}
