// Core trading logic modules

pub mod data_gate;
pub mod engine;
pub mod error_handling;
pub mod instruments;
pub mod liveness;
pub mod position_store;
pub mod risk;
pub mod trade_manager;

// Re-export commonly used types
pub use data_gate::{BarVerdict, DataIntegrityGate, GapWarning, RejectReason};
pub use engine::TradingEngine;
pub use error_handling::{HaltGate, HaltReason, RetryPolicy};
pub use instruments::{
    FileInstrumentSource, InstrumentRules, InstrumentRulesCache, InstrumentSource, PushOnlySource,
    StaticInstrumentSource,
};
pub use liveness::{FileHeartbeatSink, HeartbeatSink, LivenessMonitor, LivenessStatus, MemoryHeartbeatSink};
pub use position_store::{JsonFileStore, ManagedPosition, MemoryStore, PersistedState, PositionStateStore};
pub use risk::{PartialClose, RiskCalculator};
pub use trade_manager::{FlattenReport, TradeManager};
