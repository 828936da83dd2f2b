// Trade manager: signals in, broker-compliant order actions out

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, PartialStage};
use crate::core::data_gate::{BarVerdict, DataIntegrityGate};
use crate::core::error_handling::{HaltGate, HaltReason, RetryPolicy};
use crate::core::instruments::{
    InstrumentRules, InstrumentRulesCache, InstrumentSource, PushOnlySource, RulesLookup,
};
use crate::core::position_store::{
    reconcile, LivenessMarker, ManagedPosition, PersistedState, PositionStateStore, ReconcileReport,
};
use crate::core::risk::{favourable_move, PartialClose, RiskCalculator};
use crate::error::{TradingError, TradingResult};
use crate::strategy::{Strategy, StrategyRegistry};
use crate::transport::{BrokerEvent, BrokerOrder, OrderAction, OrderRequest, OrderTransport};
use crate::types::{AccountSnapshot, Bar, Clock, Direction, Quote, Signal, SystemClock};

/// Bars kept beyond the strategy's own look-back
const HISTORY_HEADROOM: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Reversal,
    PartialStage,
    Flatten,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingKind {
    Open { direction: Direction },
    Modify { stop_loss: f64 },
    PartialClose { stage: usize, volume: f64 },
    Close { reason: CloseReason },
    Refresh,
}

/// A dispatched action still waiting for its confirmation
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub request: OrderRequest,
    pub symbol: String,
    pub ticket: Option<u64>,
    pub kind: PendingKind,
}

/// Outcome of a flatten-all pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenReport {
    pub dispatched: Vec<u64>,
    pub already_pending: Vec<u64>,
    pub failed: Vec<u64>,
}

impl FlattenReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct SymbolContext {
    gate: DataIntegrityGate,
    bars: VecDeque<Bar>,
    strategy: Box<dyn Strategy>,
    /// Live bars are dropped until this is set
    preloaded: bool,
}

/// Single authority over this instance's positions.
///
/// Every mutation of [`ManagedPosition`]s goes through `&mut self`, so the
/// owner decides the serialization (the engine keeps it behind one mutex).
/// State changes are persisted before the triggering call returns.
pub struct TradeManager {
    tag: String,
    magic: u64,
    risk: RiskCalculator,
    rules: InstrumentRulesCache,
    source: Box<dyn InstrumentSource>,
    refresh_timeout: Duration,
    store: Box<dyn PositionStateStore>,
    retry: RetryPolicy,
    transport: Box<dyn OrderTransport>,
    clock: Arc<dyn Clock>,
    account: Option<AccountSnapshot>,
    quotes: HashMap<String, Quote>,
    positions: BTreeMap<u64, ManagedPosition>,
    liveness: LivenessMarker,
    pending: HashMap<Uuid, PendingAction>,
    pending_reversals: HashMap<String, Direction>,
    symbols: BTreeMap<String, SymbolContext>,
    halt: HaltGate,
    confirmation_timeout: chrono::Duration,
    history_limit: usize,
    /// Loaded state has been checked against a broker snapshot (or there was nothing to check)
    ready: bool,
    snapshot_seen: bool,
}

impl TradeManager {
    pub fn new(
        config: &Config,
        registry: &StrategyRegistry,
        store: Box<dyn PositionStateStore>,
        transport: Box<dyn OrderTransport>,
    ) -> TradingResult<Self> {
        let period = config.strategy.timeframe.as_duration();
        let mut symbols = BTreeMap::new();
        for symbol in &config.strategy.symbols {
            let strategy = registry.create(&config.strategy.name, &config.strategy.params)?;
            symbols.insert(
                symbol.clone(),
                SymbolContext {
                    gate: DataIntegrityGate::new(symbol.clone(), period, &config.data),
                    bars: VecDeque::new(),
                    strategy,
                    preloaded: !config.strategy.preload_history,
                },
            );
        }

        Ok(Self {
            tag: config.strategy.tag.clone(),
            magic: config.strategy.magic,
            risk: RiskCalculator::new(config.risk.clone()),
            rules: InstrumentRulesCache::new(config.instruments.max_age()),
            source: Box::new(PushOnlySource),
            refresh_timeout: config.instruments.refresh_timeout(),
            store,
            retry: RetryPolicy::from_config(&config.persistence),
            transport,
            clock: Arc::new(SystemClock),
            account: None,
            quotes: HashMap::new(),
            positions: BTreeMap::new(),
            liveness: LivenessMarker::default(),
            pending: HashMap::new(),
            pending_reversals: HashMap::new(),
            symbols,
            halt: HaltGate::new(),
            confirmation_timeout: chrono::Duration::seconds(
                config.transport.confirmation_timeout_secs as i64,
            ),
            history_limit: config.strategy.history_bars + HISTORY_HEADROOM,
            ready: false,
            snapshot_seen: false,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_instrument_source(mut self, source: Box<dyn InstrumentSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn positions(&self) -> &BTreeMap<u64, ManagedPosition> {
        &self.positions
    }

    pub fn position(&self, ticket: u64) -> Option<&ManagedPosition> {
        self.positions.get(&ticket)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.values()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    pub fn halt_reasons(&self) -> Vec<HaltReason> {
        self.halt.reasons().collect()
    }

    pub fn account(&self) -> Option<&AccountSnapshot> {
        self.account.as_ref()
    }

    pub fn liveness_marker(&self) -> &LivenessMarker {
        &self.liveness
    }

    /// Accepted bars for a symbol, oldest first
    pub fn bars(&self, symbol: &str) -> Vec<Bar> {
        self.symbols
            .get(symbol)
            .map(|ctx| ctx.bars.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            liveness: self.liveness.clone(),
            positions: self.positions.clone(),
            ..PersistedState::empty(&self.tag)
        }
    }

    /// Load persisted state. Must run before any event is handled.
    pub fn recover(&mut self) -> TradingResult<usize> {
        let loaded = self
            .retry
            .execute("load state", |_| self.store.load(&self.tag));

        match loaded {
            Ok(Some(state)) => {
                self.positions = state.positions;
                self.liveness = state.liveness;
                self.ready = self.positions.is_empty();
                info!(
                    tag = %self.tag,
                    positions = self.positions.len(),
                    dead_episodes = self.liveness.dead_episodes,
                    "📂 Recovered persisted state"
                );
                Ok(self.positions.len())
            }
            Ok(None) => {
                self.ready = true;
                info!(tag = %self.tag, "📂 No persisted state, starting flat");
                Ok(0)
            }
            Err(e) => {
                error!(
                    tag = %self.tag,
                    reason = %e,
                    "💾 Persisted state unreadable; new orders halted until the broker snapshot arrives"
                );
                self.halt.halt(HaltReason::StateUnreadable);
                Err(e)
            }
        }
    }

    pub fn handle_event(&mut self, event: BrokerEvent) -> TradingResult<()> {
        self.expire_pending();
        debug!(tag = %self.tag, event = event.kind(), "event");

        match event {
            BrokerEvent::Account(snapshot) => {
                self.on_account(snapshot);
                Ok(())
            }
            BrokerEvent::Quote { symbol, bid, ask, at } => {
                let at = at.unwrap_or_else(|| self.clock.now());
                self.on_price_update(&symbol, bid, ask, at)
            }
            BrokerEvent::Bar { symbol, bar } => self.on_bar(&symbol, bar),
            BrokerEvent::History { symbol, bars } => self.on_history(&symbol, bars),
            BrokerEvent::InstrumentRules { symbol, rules } => {
                self.on_instrument_rules(&symbol, rules);
                Ok(())
            }
            BrokerEvent::OrderOpened { token, order } => self.on_order_opened(token, order),
            BrokerEvent::OrderModified {
                token,
                ticket,
                stop_loss,
                take_profit,
            } => self.on_order_modified(token, ticket, stop_loss, take_profit),
            BrokerEvent::OrderPartiallyClosed {
                token,
                ticket,
                closed_volume,
                remaining_volume,
            } => self.on_order_partially_closed(token, ticket, closed_volume, remaining_volume),
            BrokerEvent::OrderClosed { token, ticket, .. } => self.on_order_closed(token, ticket),
            BrokerEvent::OrderRejected { token, reason } => {
                self.on_order_rejected(token, &reason);
                Ok(())
            }
            BrokerEvent::OpenOrders { orders } => self.on_open_orders(&orders).map(|_| ()),
            BrokerEvent::Heartbeat { .. } => Ok(()),
        }
    }

    pub fn on_account(&mut self, snapshot: AccountSnapshot) {
        if !(snapshot.equity.is_finite() && snapshot.balance.is_finite()) {
            warn!(tag = %self.tag, reason = "non-finite balance or equity", "🚫 Account update dropped");
            return;
        }
        debug!(tag = %self.tag, equity = snapshot.equity, balance = snapshot.balance, "account");
        self.account = Some(snapshot);
    }

    pub fn on_instrument_rules(&mut self, symbol: &str, rules: InstrumentRules) {
        if let Err(reason) = rules.validate() {
            warn!(tag = %self.tag, symbol, reason = %reason, "🚫 Instrument rules dropped");
            return;
        }
        self.rules.insert(symbol, rules, self.clock.now());
        self.pending
            .retain(|_, p| !(p.kind == PendingKind::Refresh && p.symbol == symbol));
        info!(tag = %self.tag, symbol, "📐 Instrument rules updated");
    }

    /// Run one bar through the gate and, if accepted, the symbol's strategy
    pub fn on_bar(&mut self, symbol: &str, bar: Bar) -> TradingResult<()> {
        let Some(ctx) = self.symbols.get_mut(symbol) else {
            debug!(tag = %self.tag, symbol, "bar for untraded symbol ignored");
            return Ok(());
        };
        if !ctx.preloaded {
            debug!(tag = %self.tag, symbol, timestamp = %bar.timestamp, "bar dropped before history preload");
            return Ok(());
        }

        match ctx.gate.check(&bar) {
            BarVerdict::Rejected(_) => return Ok(()),
            BarVerdict::Duplicate => {
                debug!(tag = %self.tag, symbol, timestamp = %bar.timestamp, "duplicate bar dropped");
                return Ok(());
            }
            BarVerdict::Accepted { gap } => {
                if gap.is_some() {
                    ctx.strategy.reset();
                    info!(
                        tag = %self.tag,
                        symbol,
                        strategy = ctx.strategy.name(),
                        "🔄 Strategy reset after data gap"
                    );
                }
                ctx.bars.push_back(bar);
                while ctx.bars.len() > self.history_limit {
                    ctx.bars.pop_front();
                }
            }
        }

        let signal = ctx.strategy.get_signal(ctx.bars.make_contiguous());
        debug!(tag = %self.tag, symbol, ?signal, close = bar.close, "strategy signal");
        self.on_signal(symbol, signal)
    }

    /// Seed a symbol's gate and window from a history batch, then run the
    /// strategy once over it. Until the first non-empty batch arrives (when
    /// preloading is configured) live bars for the symbol are dropped.
    pub fn on_history(&mut self, symbol: &str, mut bars: Vec<Bar>) -> TradingResult<()> {
        let Some(ctx) = self.symbols.get_mut(symbol) else {
            debug!(tag = %self.tag, symbol, "history for untraded symbol ignored");
            return Ok(());
        };
        if bars.is_empty() {
            warn!(tag = %self.tag, symbol, reason = "empty history batch", "📚 History preload failed");
            return Ok(());
        }

        bars.sort_by_key(|b| b.timestamp);
        let mut seeded = 0;
        for bar in bars {
            match ctx.gate.check(&bar) {
                BarVerdict::Accepted { gap } => {
                    if gap.is_some() {
                        ctx.strategy.reset();
                    }
                    ctx.bars.push_back(bar);
                    seeded += 1;
                }
                BarVerdict::Rejected(_) | BarVerdict::Duplicate => {}
            }
        }
        while ctx.bars.len() > self.history_limit {
            ctx.bars.pop_front();
        }

        let first_preload = !ctx.preloaded;
        ctx.preloaded = true;
        info!(tag = %self.tag, symbol, seeded, window = ctx.bars.len(), "📚 History preloaded");
        if !first_preload || ctx.bars.is_empty() {
            return Ok(());
        }

        // Initial analysis over the seeded window
        let signal = ctx.strategy.get_signal(ctx.bars.make_contiguous());
        debug!(tag = %self.tag, symbol, ?signal, "initial strategy signal");
        self.on_signal(symbol, signal)
    }

    pub fn on_signal(&mut self, symbol: &str, signal: Signal) -> TradingResult<()> {
        let Some(direction) = signal.direction() else {
            return Ok(());
        };

        if !self.ready {
            info!(tag = %self.tag, symbol, %direction, reason = "awaiting broker reconciliation", "⏸️  Signal held");
            return Ok(());
        }
        if self.pending_reversals.contains_key(symbol) || self.has_pending_open(symbol) {
            info!(tag = %self.tag, symbol, %direction, reason = "order already in flight", "⏸️  Signal ignored");
            return Ok(());
        }

        let existing: Vec<(u64, Direction)> = self
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| (p.ticket, p.direction))
            .collect();

        if existing.is_empty() {
            if let Err(e) = self.open_position(direction, symbol) {
                warn!(
                    tag = %self.tag,
                    symbol,
                    %direction,
                    category = e.category(),
                    reason = %e,
                    "⏭️  Open skipped"
                );
            }
            return Ok(());
        }

        if existing.iter().all(|(_, d)| *d == direction) {
            debug!(tag = %self.tag, symbol, %direction, reason = "position already open", "hold");
            return Ok(());
        }

        // Opposite signal: close first, reopen once the close is confirmed
        let mut dispatched = 0;
        for (ticket, _) in existing.into_iter().filter(|(_, d)| *d != direction) {
            if self.close_pending(ticket) {
                continue;
            }
            let action = OrderAction::Close { ticket, volume: None };
            let kind = PendingKind::Close {
                reason: CloseReason::Reversal,
            };
            match self.dispatch(symbol, Some(ticket), kind, action) {
                Ok(token) => {
                    dispatched += 1;
                    info!(tag = %self.tag, symbol, ticket, %token, reason = "reversal", "📤 Close dispatched");
                }
                Err(e) => {
                    error!(tag = %self.tag, symbol, ticket, reason = %e, "❌ Reversal close not dispatched");
                }
            }
        }
        if dispatched > 0 {
            self.pending_reversals.insert(symbol.to_string(), direction);
        } else {
            info!(tag = %self.tag, symbol, %direction, reason = "opposite position already closing", "⏭️  Reversal skipped");
        }
        Ok(())
    }

    /// Size and dispatch a new order. The position itself only exists once
    /// the broker confirms it. Returns `None` when the signal had to be held
    /// for fresh instrument rules.
    pub fn open_position(&mut self, direction: Direction, symbol: &str) -> TradingResult<Option<Uuid>> {
        self.halt.check_opens()?;

        let equity = self
            .account
            .as_ref()
            .map(|a| a.equity)
            .ok_or_else(|| TradingError::InvalidParameter("account".to_string(), "no account snapshot yet".to_string()))?;
        let quote = self
            .quotes
            .get(symbol)
            .copied()
            .ok_or_else(|| TradingError::InvalidParameter("quote".to_string(), format!("no quote for {}", symbol)))?;

        let Some(rules) = self.rules_for_sizing(symbol)? else {
            return Ok(None);
        };

        let stop = self.risk.stop_loss_level(direction, &quote, &rules)?;
        let volume = match self.risk.config().fixed_lot {
            Some(lot) => self.risk.fixed_size(lot, &rules)?,
            None => {
                let risk_fraction = self.risk.config().risk_per_trade;
                self.risk.position_size(equity, risk_fraction, stop.distance, &rules)?
            }
        };
        let take_profit = self
            .risk
            .take_profit_level(direction, &quote, equity, volume, &rules)?;

        let action = OrderAction::Open {
            symbol: symbol.to_string(),
            direction,
            volume,
            stop_loss: Some(stop.price),
            take_profit: take_profit.map(|tp| tp.price),
            magic: self.magic,
            comment: self.tag.clone(),
        };
        let token = self.dispatch(symbol, None, PendingKind::Open { direction }, action)?;
        info!(
            tag = %self.tag,
            symbol,
            %direction,
            volume,
            stop_loss = stop.price,
            take_profit = ?take_profit.map(|tp| tp.price),
            %token,
            "📤 Open dispatched"
        );
        Ok(Some(token))
    }

    /// Fresh rules for sizing, refreshing synchronously when stale or missing
    fn rules_for_sizing(&mut self, symbol: &str) -> TradingResult<Option<InstrumentRules>> {
        let now = self.clock.now();
        match self.rules.lookup(symbol, now) {
            RulesLookup::Fresh(rules) => return Ok(Some(rules)),
            RulesLookup::Stale { age, .. } => {
                info!(tag = %self.tag, symbol, age_secs = age.as_secs(), "📐 Instrument rules stale, refreshing");
            }
            RulesLookup::Missing => {
                info!(tag = %self.tag, symbol, "📐 No instrument rules yet, fetching");
            }
        }

        match self.source.fetch(symbol, self.refresh_timeout) {
            Ok(rules) => {
                rules.validate().map_err(|reason| TradingError::InstrumentRulesUnavailable {
                    symbol: symbol.to_string(),
                    reason,
                })?;
                self.rules.insert(symbol, rules, now);
                Ok(Some(rules))
            }
            Err(e) => {
                warn!(tag = %self.tag, symbol, reason = %e, "⏸️  Signal held until instrument rules arrive");
                self.request_refresh(symbol);
                Ok(None)
            }
        }
    }

    fn request_refresh(&mut self, symbol: &str) {
        let already = self
            .pending
            .values()
            .any(|p| p.kind == PendingKind::Refresh && p.symbol == symbol);
        if already {
            return;
        }
        let action = OrderAction::RefreshInstrument {
            symbol: symbol.to_string(),
        };
        if let Err(e) = self.dispatch(symbol, None, PendingKind::Refresh, action) {
            warn!(tag = %self.tag, symbol, reason = %e, "⚠️  Instrument refresh request not dispatched");
        }
    }

    /// Trailing stop first, then partial take-profit stages, for every
    /// position on the symbol
    pub fn on_price_update(&mut self, symbol: &str, bid: f64, ask: f64, at: DateTime<Utc>) -> TradingResult<()> {
        if !(bid.is_finite() && ask.is_finite() && bid > 0.0 && ask >= bid) {
            warn!(tag = %self.tag, symbol, bid, ask, reason = "invalid quote", "🚫 Price update dropped");
            return Ok(());
        }
        let quote = Quote { bid, ask, at };
        self.quotes.insert(symbol.to_string(), quote);

        if !self.ready {
            return Ok(());
        }

        let tickets: Vec<u64> = self
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.ticket)
            .collect();
        for ticket in tickets {
            self.apply_trailing(ticket, &quote)?;
            self.apply_partial_stages(ticket, &quote)?;
        }
        Ok(())
    }

    fn apply_trailing(&mut self, ticket: u64, quote: &Quote) -> TradingResult<()> {
        let Some(trailing) = self.risk.config().trailing else {
            return Ok(());
        };
        let Some(position) = self.positions.get(&ticket) else {
            return Ok(());
        };

        let direction = position.direction;
        let price = direction.exit_price(quote);
        let reference = self.protective_stop(position);
        let trail = self.risk.trailing_stop_level(
            direction,
            price,
            position.high_water_mark,
            trailing.trail_fraction,
            reference,
        );
        let open_price = position.open_price;
        let take_profit = position.take_profit;
        let symbol = position.symbol.clone();

        if trail.high_water_mark != position.high_water_mark {
            if let Some(p) = self.positions.get_mut(&ticket) {
                p.high_water_mark = trail.high_water_mark;
            }
            // A failed save halts opens; stop management carries on
            let _ = self.persist();
        }

        if favourable_move(direction, price, open_price) < trailing.activation_fraction || self.close_pending(ticket) {
            return Ok(());
        }

        let mut candidate = trail.stop;
        if let Some(rules) = self.rules.last_known(&symbol) {
            let boundary = price - direction.sign() * self.risk.min_stop_distance(&rules);
            candidate = match direction {
                Direction::Buy => candidate.min(boundary),
                Direction::Sell => candidate.max(boundary),
            };
            candidate = rules.normalize_price(candidate);
        }

        let min_step = (trailing.step_fraction * price).max(f64::EPSILON);
        let improves = match reference {
            Some(current) => direction.sign() * (candidate - current) >= min_step,
            None => true,
        };
        if !improves {
            return Ok(());
        }

        let action = OrderAction::Modify {
            ticket,
            stop_loss: Some(candidate),
            take_profit,
        };
        match self.dispatch(&symbol, Some(ticket), PendingKind::Modify { stop_loss: candidate }, action) {
            Ok(token) => info!(
                tag = %self.tag,
                symbol = %symbol,
                ticket,
                stop_loss = candidate,
                high_water_mark = trail.high_water_mark,
                previous = ?reference,
                %token,
                "🔒 Trailing stop advanced"
            ),
            Err(e) => warn!(tag = %self.tag, symbol = %symbol, ticket, reason = %e, "⚠️  Trailing modify not dispatched"),
        }
        Ok(())
    }

    fn apply_partial_stages(&mut self, ticket: u64, quote: &Quote) -> TradingResult<()> {
        let stages: Vec<PartialStage> = self.risk.config().partial_take_profit.clone();
        let Some(position) = self.positions.get(&ticket) else {
            return Ok(());
        };
        if stages.is_empty() || self.close_pending(ticket) {
            return Ok(());
        }

        let direction = position.direction;
        let symbol = position.symbol.clone();
        let price = direction.exit_price(quote);
        let open_price = position.open_price;
        let initial_volume = position.initial_volume;
        let mut open_volume = position.volume - self.pending_partial_volume(ticket);
        let mut index = position.next_stage();

        while let Some(stage) = stages.get(index) {
            let distance = open_price * stage.trigger_fraction;
            if !self.risk.partial_take_profit_trigger(direction, price, open_price, distance) {
                break;
            }
            let Some(rules) = self.rules.last_known(&symbol) else {
                warn!(tag = %self.tag, symbol = %symbol, ticket, stage = index, reason = "no instrument rules", "⏸️  Partial take-profit deferred");
                self.request_refresh(&symbol);
                break;
            };
            let plan = self
                .risk
                .partial_close_volume(initial_volume, stage.close_fraction, open_volume, &rules);

            // Mark and persist before dispatch: a stage fires at most once.
            // A failed save still dispatches; the next good save records the mark.
            if let Some(p) = self.positions.get_mut(&ticket) {
                p.mark_stage(index);
            }
            if self.persist().is_err() {
                warn!(tag = %self.tag, symbol = %symbol, ticket, stage = index, "💾 Stage mark not yet durable; dispatching anyway");
            }

            let (action, kind, closes_all) = match plan {
                PartialClose::TooSmall => {
                    info!(tag = %self.tag, symbol = %symbol, ticket, stage = index, reason = "close volume below minimum lot", "⏭️  Partial take-profit stage consumed without order");
                    index += 1;
                    continue;
                }
                PartialClose::Volume(volume) => (
                    OrderAction::Close { ticket, volume: Some(volume) },
                    PendingKind::PartialClose { stage: index, volume },
                    false,
                ),
                PartialClose::All => (
                    OrderAction::Close { ticket, volume: None },
                    PendingKind::Close {
                        reason: CloseReason::PartialStage,
                    },
                    true,
                ),
            };

            match self.dispatch(&symbol, Some(ticket), kind, action) {
                Ok(token) => {
                    if let PendingKind::PartialClose { volume, .. } = kind {
                        open_volume -= volume;
                        info!(tag = %self.tag, symbol = %symbol, ticket, stage = index, volume, price, %token, "💰 Partial take-profit dispatched");
                    } else {
                        info!(tag = %self.tag, symbol = %symbol, ticket, stage = index, price, %token, reason = "remainder below minimum lot", "💰 Partial take-profit closes whole position");
                    }
                }
                Err(e) => {
                    // Nothing left the process: re-arm the stage for the next price
                    error!(tag = %self.tag, symbol = %symbol, ticket, stage = index, reason = %e, "❌ Partial take-profit dispatch failed; stage re-armed");
                    if let Some(p) = self.positions.get_mut(&ticket) {
                        p.unmark_stage(index);
                    }
                    let _ = self.persist();
                    break;
                }
            }
            if closes_all {
                break;
            }
            index += 1;
        }
        Ok(())
    }

    pub fn on_order_opened(&mut self, token: Option<Uuid>, order: BrokerOrder) -> TradingResult<()> {
        if order.magic != self.magic {
            debug!(tag = %self.tag, ticket = order.ticket, magic = order.magic, "order of another instance ignored");
            return Ok(());
        }
        let pending = token.and_then(|t| self.pending.remove(&t));

        if self.positions.contains_key(&order.ticket) {
            debug!(tag = %self.tag, ticket = order.ticket, "duplicate open confirmation");
            return Ok(());
        }
        if pending.is_none() {
            warn!(
                tag = %self.tag,
                symbol = %order.symbol,
                ticket = order.ticket,
                reason = "no matching pending open",
                "⚠️  Tracking unexpected open order carrying our magic number"
            );
        }

        let position = ManagedPosition::from_broker_order(&order, &self.tag);
        info!(
            tag = %self.tag,
            symbol = %position.symbol,
            ticket = position.ticket,
            direction = %position.direction,
            volume = position.volume,
            open_price = position.open_price,
            "✅ Position opened"
        );
        self.positions.insert(order.ticket, position);
        self.persist()
    }

    pub fn on_order_modified(
        &mut self,
        token: Option<Uuid>,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradingResult<()> {
        if let Some(t) = token {
            self.pending.remove(&t);
        }
        let Some(position) = self.positions.get_mut(&ticket) else {
            debug!(tag = %self.tag, ticket, "modification for untracked ticket");
            return Ok(());
        };
        if position.stop_loss == stop_loss && position.take_profit == take_profit {
            return Ok(());
        }
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        info!(tag = %self.tag, symbol = %position.symbol, ticket, ?stop_loss, ?take_profit, "🔧 Order modified");
        self.persist()
    }

    pub fn on_order_partially_closed(
        &mut self,
        token: Option<Uuid>,
        ticket: u64,
        closed_volume: f64,
        remaining_volume: f64,
    ) -> TradingResult<()> {
        if let Some(t) = token {
            self.pending.remove(&t);
        }
        let Some(position) = self.positions.get_mut(&ticket) else {
            debug!(tag = %self.tag, ticket, "partial close for untracked ticket");
            return Ok(());
        };
        if !position.shrink_to(remaining_volume) {
            warn!(tag = %self.tag, symbol = %position.symbol, ticket, tracked = position.volume, reported = remaining_volume, "⚠️  Partial close reports a larger volume; ignored");
            return Ok(());
        }
        info!(tag = %self.tag, symbol = %position.symbol, ticket, closed_volume, remaining_volume, "✂️  Position partially closed");

        if remaining_volume <= 1e-9 {
            return self.on_order_closed(None, ticket);
        }
        self.persist()
    }

    pub fn on_order_closed(&mut self, token: Option<Uuid>, ticket: u64) -> TradingResult<()> {
        if let Some(t) = token {
            self.pending.remove(&t);
        }
        self.pending.retain(|_, p| p.ticket != Some(ticket));

        let Some(position) = self.positions.remove(&ticket) else {
            debug!(tag = %self.tag, ticket, "close for untracked ticket");
            return Ok(());
        };
        info!(tag = %self.tag, symbol = %position.symbol, ticket, "🏁 Position closed");
        let persisted = self.persist();
        self.after_position_removed(&position.symbol);
        persisted
    }

    /// Complete a pending reversal once the symbol is flat
    fn after_position_removed(&mut self, symbol: &str) {
        if self.positions.values().any(|p| p.symbol == symbol) {
            return;
        }
        let Some(direction) = self.pending_reversals.remove(symbol) else {
            return;
        };
        info!(tag = %self.tag, symbol, %direction, "🔁 Prior position closed, reopening for reversal");
        if let Err(e) = self.open_position(direction, symbol) {
            warn!(tag = %self.tag, symbol, %direction, category = e.category(), reason = %e, "⏭️  Reversal open skipped");
        }
    }

    pub fn on_order_rejected(&mut self, token: Uuid, reason: &str) {
        let Some(pending) = self.pending.remove(&token) else {
            warn!(tag = %self.tag, %token, reason, "❌ Rejection for unknown request");
            return;
        };
        warn!(
            tag = %self.tag,
            symbol = %pending.symbol,
            ticket = ?pending.ticket,
            %token,
            action = pending.request.action.kind(),
            reason,
            "❌ Order rejected"
        );
        match pending.kind {
            PendingKind::Close {
                reason: CloseReason::Reversal,
            } => {
                if self.pending_reversals.remove(&pending.symbol).is_some() {
                    warn!(tag = %self.tag, symbol = %pending.symbol, "🔁 Reversal abandoned after close rejection");
                }
            }
            PendingKind::PartialClose { stage, .. } => {
                info!(tag = %self.tag, symbol = %pending.symbol, ticket = ?pending.ticket, stage, "Partial take-profit stage stays consumed");
            }
            _ => {}
        }
    }

    /// Reconcile tracked positions with a broker snapshot. The first snapshot
    /// after start-up also adopts unknown orders carrying our magic number.
    pub fn on_open_orders(&mut self, orders: &[BrokerOrder]) -> TradingResult<ReconcileReport> {
        let adopt = !self.snapshot_seen;
        let report = reconcile(&mut self.positions, orders, &self.tag, self.magic, adopt);

        if !self.snapshot_seen {
            self.snapshot_seen = true;
            self.ready = true;
            info!(
                tag = %self.tag,
                positions = self.positions.len(),
                orphans = report.orphans.len(),
                adopted = report.adopted.len(),
                "🔁 Reconciled with broker"
            );
            if self.halt.is_halted_for(HaltReason::StateUnreadable) {
                warn!(tag = %self.tag, "Partial take-profit history of adopted positions is unknown; stages restart from the first");
                self.halt.clear(HaltReason::StateUnreadable);
            }
        }

        for ticket in &report.orphans {
            self.pending.retain(|_, p| p.ticket != Some(*ticket));
        }
        if report.changed() {
            self.persist()?;
        }

        let symbols: Vec<String> = self.pending_reversals.keys().cloned().collect();
        for symbol in symbols {
            self.after_position_removed(&symbol);
        }
        Ok(report)
    }

    /// Dispatch a full close for every tracked position. Safe to repeat:
    /// positions already being closed are skipped.
    pub fn flatten_all(&mut self, reason: &str) -> FlattenReport {
        let mut report = FlattenReport::default();
        self.pending_reversals.clear();

        let targets: Vec<(u64, String)> = self
            .positions
            .values()
            .map(|p| (p.ticket, p.symbol.clone()))
            .collect();
        for (ticket, symbol) in targets {
            if self.close_pending(ticket) {
                report.already_pending.push(ticket);
                continue;
            }
            let action = OrderAction::Close { ticket, volume: None };
            let kind = PendingKind::Close {
                reason: CloseReason::Flatten,
            };
            match self.dispatch(&symbol, Some(ticket), kind, action) {
                Ok(token) => {
                    info!(tag = %self.tag, symbol = %symbol, ticket, %token, reason, "🧯 Flatten close dispatched");
                    report.dispatched.push(ticket);
                }
                Err(e) => {
                    error!(tag = %self.tag, symbol = %symbol, ticket, reason = %e, "❌ Flatten close failed");
                    report.failed.push(ticket);
                }
            }
        }
        report
    }

    /// Safety action for a DEAD counterpart: halt opens and flatten
    pub fn on_counterpart_dead(&mut self, at: DateTime<Utc>) -> FlattenReport {
        self.halt.halt(HaltReason::CounterpartDead);
        self.liveness.dead_episodes += 1;
        self.liveness.last_dead_at = Some(at);
        if let Err(e) = self.persist() {
            error!(tag = %self.tag, reason = %e, "💾 Could not record counterpart death");
        }
        let report = self.flatten_all("counterpart dead");
        warn!(
            tag = %self.tag,
            dispatched = report.dispatched.len(),
            already_pending = report.already_pending.len(),
            failed = report.failed.len(),
            "🧯 Flatten-all after counterpart death"
        );
        report
    }

    /// The counterpart is back. Positions closed meanwhile stay closed.
    pub fn on_counterpart_alive(&mut self) {
        if self.halt.is_halted_for(HaltReason::CounterpartDead) {
            self.halt.clear(HaltReason::CounterpartDead);
            info!(tag = %self.tag, "💚 Counterpart back; positions closed while it was down are not reopened");
        }
    }

    /// Final durable save before exit
    pub fn shutdown(&mut self) -> TradingResult<()> {
        info!(tag = %self.tag, positions = self.positions.len(), pending = self.pending.len(), "🛑 Trade manager shutting down");
        self.persist()
    }

    fn persist(&mut self) -> TradingResult<()> {
        let state = self.snapshot();
        let saved = self
            .retry
            .execute("save state", |_| self.store.save(&self.tag, &state));
        match saved {
            Ok(()) => {
                self.halt.clear(HaltReason::PersistenceFailure);
                Ok(())
            }
            Err(e) => {
                error!(tag = %self.tag, category = e.category(), reason = %e, "💾 State save failed; new orders halted");
                self.halt.halt(HaltReason::PersistenceFailure);
                Err(e)
            }
        }
    }

    fn dispatch(
        &mut self,
        symbol: &str,
        ticket: Option<u64>,
        kind: PendingKind,
        action: OrderAction,
    ) -> TradingResult<Uuid> {
        let request = OrderRequest::new(action, self.clock.now());
        self.transport.dispatch(&request)?;
        let token = request.token;
        self.pending.insert(
            token,
            PendingAction {
                request,
                symbol: symbol.to_string(),
                ticket,
                kind,
            },
        );
        Ok(token)
    }

    fn expire_pending(&mut self) {
        let cutoff = self.clock.now() - self.confirmation_timeout;
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.request.issued_at < cutoff)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(pending) = self.pending.remove(&token) {
                warn!(
                    tag = %self.tag,
                    symbol = %pending.symbol,
                    ticket = ?pending.ticket,
                    %token,
                    action = pending.request.action.kind(),
                    reason = "no confirmation in time",
                    "⌛ Pending action expired"
                );
                if pending.kind == (PendingKind::Close { reason: CloseReason::Reversal }) {
                    self.pending_reversals.remove(&pending.symbol);
                }
            }
        }
    }

    fn has_pending_open(&self, symbol: &str) -> bool {
        self.pending
            .values()
            .any(|p| p.symbol == symbol && matches!(p.kind, PendingKind::Open { .. }))
    }

    fn close_pending(&self, ticket: u64) -> bool {
        self.pending
            .values()
            .any(|p| p.ticket == Some(ticket) && matches!(p.kind, PendingKind::Close { .. }))
    }

    fn pending_partial_volume(&self, ticket: u64) -> f64 {
        self.pending
            .values()
            .filter(|p| p.ticket == Some(ticket))
            .map(|p| match p.kind {
                PendingKind::PartialClose { volume, .. } => volume,
                _ => 0.0,
            })
            .sum()
    }

    /// Tightest of the confirmed stop and any stop still awaiting confirmation
    fn protective_stop(&self, position: &ManagedPosition) -> Option<f64> {
        let pending = self.pending.values().filter_map(|p| match p.kind {
            PendingKind::Modify { stop_loss } if p.ticket == Some(position.ticket) => Some(stop_loss),
            _ => None,
        });
        position.stop_loss.into_iter().chain(pending).reduce(|a, b| match position.direction {
            Direction::Buy => a.max(b),
            Direction::Sell => a.min(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::position_store::MemoryStore;
    use crate::transport::RecordingTransport;

    fn manager() -> (TradeManager, RecordingTransport) {
        let transport = RecordingTransport::new();
        let mut manager = TradeManager::new(
            &Config::default(),
            &StrategyRegistry::with_builtins(),
            Box::new(MemoryStore::new()),
            Box::new(transport.clone()),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::no_retry());
        manager.recover().unwrap();
        (manager, transport)
    }

    #[test]
    fn test_open_needs_account_and_quote() {
        let (mut manager, transport) = manager();
        assert!(manager.open_position(Direction::Buy, "EURUSD").is_err());
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_hold_is_a_no_op() {
        let (mut manager, transport) = manager();
        manager.on_signal("EURUSD", Signal::Hold).unwrap();
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_missing_rules_request_refresh_once() {
        let (mut manager, transport) = manager();
        manager.on_account(AccountSnapshot {
            balance: 10_000.0,
            equity: 10_000.0,
            currency: "USD".to_string(),
            leverage: 100,
        });
        manager.on_price_update("EURUSD", 1.1000, 1.1002, Utc::now()).unwrap();

        assert_eq!(manager.open_position(Direction::Buy, "EURUSD").unwrap(), None);
        assert_eq!(manager.open_position(Direction::Buy, "EURUSD").unwrap(), None);
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action.kind(), "refresh_instrument");
    }
}
