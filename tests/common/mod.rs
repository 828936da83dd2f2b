// Common test utilities and helpers

#![allow(dead_code)]

use std::sync::Arc;

use bridge_trader::config::{LevelSpec, PartialStage, RiskConfig, TrailingConfig};
use bridge_trader::core::error_handling::RetryPolicy;
use bridge_trader::core::instruments::InstrumentRules;
use bridge_trader::core::position_store::MemoryStore;
use bridge_trader::strategy::StrategyRegistry;
use bridge_trader::transport::{BrokerOrder, RecordingTransport};
use bridge_trader::types::{AccountSnapshot, Bar, Clock, Direction, ManualClock, Timeframe};
use bridge_trader::{Config, TradeManager};
use chrono::{DateTime, Duration, Utc};

pub const MAGIC: u64 = 202402;

pub fn eurusd_rules() -> InstrumentRules {
    InstrumentRules {
        min_lot: 0.01,
        max_lot: 100.0,
        lot_step: 0.01,
        stop_level: 0.0003,
        digits: 5,
        tick_value: 1.0,
    }
}

/// Tick-counter strategy on EURUSD M1, 1% risk with a 50-pip stop and no
/// trailing or partial stages
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.strategy.tag = "test-eurusd".to_string();
    config.strategy.magic = MAGIC;
    config.strategy.name = "tick_counter".to_string();
    config.strategy.params = toml::Table::new();
    config.strategy.timeframe = Timeframe::Minutes(1);
    config.strategy.symbols = vec!["EURUSD".to_string()];
    config.risk = RiskConfig {
        risk_per_trade: 0.01,
        fixed_lot: None,
        stop_loss: LevelSpec::PriceDistance(0.0050),
        take_profit: None,
        stop_level_buffer: 1.5,
        trailing: None,
        partial_take_profit: Vec::new(),
    };
    config.liveness.heartbeat_file = None;
    config.instruments.symbols.insert("EURUSD".to_string(), eurusd_rules());
    config
}

pub fn with_partial_stages(mut config: Config) -> Config {
    config.risk.partial_take_profit = vec![
        PartialStage {
            trigger_fraction: 0.001,
            close_fraction: 0.5,
        },
        PartialStage {
            trigger_fraction: 0.002,
            close_fraction: 0.25,
        },
    ];
    config
}

pub fn with_trailing(mut config: Config) -> Config {
    config.risk.trailing = Some(TrailingConfig {
        activation_fraction: 0.001,
        trail_fraction: 0.001,
        step_fraction: 0.0001,
    });
    config
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

pub fn minute(n: i64) -> DateTime<Utc> {
    start_time() + Duration::minutes(n)
}

pub fn bar_at(n: i64, close: f64) -> Bar {
    Bar {
        timestamp: minute(n),
        open: close,
        high: close + 0.0005,
        low: close - 0.0005,
        close,
        volume: 100.0,
    }
}

pub fn account(equity: f64) -> AccountSnapshot {
    AccountSnapshot {
        balance: equity,
        equity,
        currency: "USD".to_string(),
        leverage: 100,
    }
}

pub fn broker_order(ticket: u64, direction: Direction, volume: f64, open_price: f64) -> BrokerOrder {
    BrokerOrder {
        ticket,
        symbol: "EURUSD".to_string(),
        direction,
        volume,
        open_price,
        stop_loss: None,
        take_profit: None,
        magic: MAGIC,
        comment: "test-eurusd".to_string(),
        opened_at: start_time(),
    }
}

/// A manager wired to shared in-memory collaborators
pub struct TestRig {
    pub manager: TradeManager,
    pub store: MemoryStore,
    pub transport: RecordingTransport,
    pub clock: Arc<ManualClock>,
}

impl TestRig {
    pub fn new(config: &Config) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    /// Build on an existing store, as a restarted process would
    pub fn with_store(config: &Config, store: MemoryStore) -> Self {
        let transport = RecordingTransport::new();
        let clock = Arc::new(ManualClock::new(start_time()));
        let manager = TradeManager::new(
            config,
            &StrategyRegistry::with_builtins(),
            Box::new(store.clone()),
            Box::new(transport.clone()),
        )
        .expect("manager should build")
        .with_clock(clock.clone())
        .with_retry_policy(RetryPolicy::no_retry());
        Self {
            manager,
            store,
            transport,
            clock,
        }
    }

    /// Recover, then give the manager an account, rules and a quote
    pub fn started(config: &Config) -> Self {
        let mut rig = Self::new(config);
        rig.manager.recover().expect("recover should succeed");
        rig.prime();
        rig
    }

    pub fn prime(&mut self) {
        self.manager.on_account(account(10_000.0));
        self.manager.on_instrument_rules("EURUSD", eurusd_rules());
        self.quote(1.1000, 1.1002);
    }

    pub fn quote(&mut self, bid: f64, ask: f64) {
        let now = self.clock.now();
        self.manager
            .on_price_update("EURUSD", bid, ask, now)
            .expect("price update should succeed");
    }
}

