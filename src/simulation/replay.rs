// Drive a trade manager through recorded bars against the paper broker

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::trade_manager::TradeManager;
use crate::error::{TradingError, TradingResult};
use crate::simulation::paper_broker::PaperBroker;
use crate::transport::{BrokerEvent, RecordingTransport};
use crate::types::{Bar, ManualClock};

/// One line of a replay file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBar {
    pub symbol: String,
    #[serde(flatten)]
    pub bar: Bar,
}

/// Read a JSON-lines bar file, skipping blank lines
pub fn load_bars(path: impl AsRef<Path>) -> TradingResult<Vec<ReplayBar>> {
    let file = File::open(path.as_ref())?;
    let mut bars = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let bar: ReplayBar = serde_json::from_str(&line).map_err(|e| {
            TradingError::InvalidParameter(format!("line {}", number + 1), e.to_string())
        })?;
        bars.push(bar);
    }
    Ok(bars)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub bars: usize,
    pub requests: usize,
    pub rejections: usize,
    pub closed_trades: usize,
    pub realized_pnl: f64,
    pub final_balance: f64,
    pub open_positions: usize,
}

/// Replays bars through a manager wired to a [`RecordingTransport`], feeding
/// each dispatched request to the paper broker until the exchange settles.
pub struct Replay {
    manager: TradeManager,
    transport: RecordingTransport,
    broker: PaperBroker,
    clock: Arc<ManualClock>,
    spread: f64,
    summary: ReplaySummary,
    starting_balance: f64,
}

impl Replay {
    /// `manager` must send through `transport` and read time from `clock`
    pub fn new(
        manager: TradeManager,
        transport: RecordingTransport,
        broker: PaperBroker,
        clock: Arc<ManualClock>,
    ) -> Self {
        let starting_balance = broker.balance();
        Self {
            manager,
            transport,
            broker,
            clock,
            spread: 0.0002,
            summary: ReplaySummary::default(),
            starting_balance,
        }
    }

    pub fn with_spread(mut self, spread: f64) -> Self {
        self.spread = spread;
        self
    }

    pub fn manager(&self) -> &TradeManager {
        &self.manager
    }

    pub fn broker(&self) -> &PaperBroker {
        &self.broker
    }

    /// Recover state and hand the manager the broker's opening picture
    pub fn start(&mut self) -> TradingResult<()> {
        if let Err(e) = self.manager.recover() {
            warn!("Replay starting without persisted state: {}", e);
        }
        let mut opening = vec![self.broker.account_event()];
        opening.extend(self.broker.rules_events());
        opening.push(self.broker.open_orders_event());
        for event in opening {
            self.deliver(event)?;
        }
        self.settle()
    }

    /// Quote at the bar's close, then the bar itself
    pub fn step(&mut self, replay_bar: &ReplayBar) -> TradingResult<()> {
        let ReplayBar { symbol, bar } = replay_bar;
        self.clock.set(bar.timestamp);
        self.summary.bars += 1;

        let bid = bar.close;
        let ask = bar.close + self.spread;
        for event in self.broker.on_quote(symbol, bid, ask, bar.timestamp) {
            self.deliver(event)?;
        }
        self.deliver(self.broker.account_event())?;
        self.settle()?;

        self.deliver(BrokerEvent::Bar {
            symbol: symbol.clone(),
            bar: *bar,
        })?;
        self.settle()
    }

    pub fn run(mut self, bars: &[ReplayBar]) -> TradingResult<ReplaySummary> {
        self.start()?;
        for bar in bars {
            self.step(bar)?;
        }
        self.finish()
    }

    pub fn finish(mut self) -> TradingResult<ReplaySummary> {
        self.manager.shutdown()?;
        let trades = self.broker.closed_trades();
        self.summary.closed_trades = trades.len();
        self.summary.final_balance = self.broker.balance();
        self.summary.realized_pnl = self.broker.balance() - self.starting_balance;
        self.summary.open_positions = self.manager.positions().len();
        info!(
            bars = self.summary.bars,
            requests = self.summary.requests,
            closed_trades = self.summary.closed_trades,
            realized_pnl = self.summary.realized_pnl,
            "🏁 Replay finished"
        );
        Ok(self.summary)
    }

    fn deliver(&mut self, event: BrokerEvent) -> TradingResult<()> {
        if let Err(e) = self.manager.handle_event(event) {
            // A replay keeps going, the same way the live loop does
            warn!(category = e.category(), "⚠️  Event handling failed: {}", e);
        }
        Ok(())
    }

    /// Execute dispatched requests until the manager stops producing new ones
    fn settle(&mut self) -> TradingResult<()> {
        for _ in 0..64 {
            let requests = self.transport.take();
            if requests.is_empty() {
                return Ok(());
            }
            for request in requests {
                self.summary.requests += 1;
                for event in self.broker.execute(&request) {
                    if matches!(event, BrokerEvent::OrderRejected { .. }) {
                        self.summary.rejections += 1;
                    }
                    self.deliver(event)?;
                }
            }
        }
        Err(TradingError::Internal(
            "order exchange did not settle; manager keeps dispatching".to_string(),
        ))
    }
}
