// Paper trading: an in-process broker counterpart and a bar replay driver

pub mod paper_broker;
pub mod replay;

pub use paper_broker::{ClosedTrade, PaperBroker};
pub use replay::{load_bars, Replay, ReplayBar, ReplaySummary};
