// Pluggable signal sources, selected by name from a registry

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{TradingError, TradingResult};
use crate::types::{Bar, Signal};

pub mod rsi;
pub mod sma_crossover;
pub mod tick_counter;

pub use rsi::RsiStrategy;
pub use sma_crossover::SmaCrossover;
pub use tick_counter::TickCounter;

/// A strategy sees the accepted bar window for one symbol, oldest first,
/// once per accepted bar.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Forget any state carried between bars
    fn reset(&mut self);

    fn get_signal(&mut self, bars: &[Bar]) -> Signal;
}

pub type StrategyFactory = fn(&toml::Table) -> TradingResult<Box<dyn Strategy>>;

#[derive(Clone)]
pub struct StrategyRegistry {
    factories: BTreeMap<&'static str, StrategyFactory>,
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("sma_crossover", |params| Ok(Box::new(SmaCrossover::from_params(params)?)));
        registry.register("rsi", |params| Ok(Box::new(RsiStrategy::from_params(params)?)));
        registry.register("tick_counter", |_| Ok(Box::new(TickCounter::new())));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: StrategyFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, name: &str, params: &toml::Table) -> TradingResult<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TradingError::StrategyNotFound(name.to_string()))?;
        factory(params)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

/// Read an optional positive integer parameter
pub(crate) fn period_param(
    strategy: &str,
    params: &toml::Table,
    key: &str,
    default: usize,
) -> TradingResult<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::Integer(n)) if *n > 0 => Ok(*n as usize),
        Some(other) => Err(TradingError::StrategyParams {
            strategy: strategy.to_string(),
            reason: format!("'{}' must be a positive integer, got {}", key, other),
        }),
    }
}

/// Read an optional numeric parameter, accepting integers too
pub(crate) fn number_param(
    strategy: &str,
    params: &toml::Table,
    key: &str,
    default: f64,
) -> TradingResult<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::Float(v)) => Ok(*v),
        Some(toml::Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(TradingError::StrategyParams {
            strategy: strategy.to_string(),
            reason: format!("'{}' must be a number, got {}", key, other),
        }),
    }
}
