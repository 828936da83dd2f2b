// Bridge Trader Library
//
// Strategy-driven order management for a broker bridge: sizing, protective levels,
// crash-safe position state and counterpart liveness

pub mod config;
pub mod core;
pub mod error; // Unified error handling
pub mod simulation;
pub mod strategy;
pub mod transport;
pub mod types;

// Re-export core trading types
pub use core::{
    DataIntegrityGate, LivenessMonitor, LivenessStatus, ManagedPosition, PositionStateStore, RiskCalculator,
    TradeManager, TradingEngine,
};
pub use types::{AccountSnapshot, Bar, Direction, Quote, Signal, Timeframe};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export configuration
pub use config::{Config, ConfigError, LoggingConfig, RiskConfig};

// Re-export transport types
pub use transport::{BrokerEvent, BrokerOrder, OrderAction, OrderRequest, OrderTransport};

// Re-export paper trading
pub use simulation::{PaperBroker, Replay, ReplaySummary};
