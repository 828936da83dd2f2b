// Durable per-order management state and its reconciliation with the broker

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{TradingError, TradingResult};
use crate::transport::BrokerOrder;
use crate::types::Direction;

pub const STATE_VERSION: u32 = 1;

/// Management state for one open order of this instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedPosition {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub open_price: f64,
    /// Volume at open; partial stages are sized from this
    pub initial_volume: f64,
    pub volume: f64,
    pub opened_at: DateTime<Utc>,
    pub magic: u64,
    pub tag: String,
    /// Most favourable exit-side price seen since open
    pub high_water_mark: f64,
    /// Partial take-profit stages already fired
    pub stages_fired: BTreeSet<usize>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl ManagedPosition {
    /// Position for an order the broker reports as open
    pub fn from_broker_order(order: &BrokerOrder, tag: &str) -> Self {
        Self {
            ticket: order.ticket,
            symbol: order.symbol.clone(),
            direction: order.direction,
            open_price: order.open_price,
            initial_volume: order.volume,
            volume: order.volume,
            opened_at: order.opened_at,
            magic: order.magic,
            tag: tag.to_string(),
            high_water_mark: order.open_price,
            stages_fired: BTreeSet::new(),
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
        }
    }

    pub fn highest_stage_fired(&self) -> Option<usize> {
        self.stages_fired.iter().next_back().copied()
    }

    /// Index of the first stage still eligible to fire
    pub fn next_stage(&self) -> usize {
        self.highest_stage_fired().map_or(0, |i| i + 1)
    }

    /// Record a stage as fired. Refuses indices at or below one already fired.
    pub fn mark_stage(&mut self, index: usize) -> bool {
        if index < self.next_stage() {
            return false;
        }
        self.stages_fired.insert(index)
    }

    /// Forget a stage whose close never left the process
    pub fn unmark_stage(&mut self, index: usize) -> bool {
        self.stages_fired.remove(&index)
    }

    /// Apply a broker-reported volume. Returns false if it would grow the position.
    pub fn shrink_to(&mut self, volume: f64) -> bool {
        if volume > self.volume + 1e-9 {
            return false;
        }
        self.volume = volume;
        true
    }
}

/// Counterpart liveness history carried across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessMarker {
    pub dead_episodes: u64,
    pub last_dead_at: Option<DateTime<Utc>>,
}

/// On-disk snapshot for one strategy tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub tag: String,
    pub positions: BTreeMap<u64, ManagedPosition>,
    #[serde(default)]
    pub liveness: LivenessMarker,
}

impl PersistedState {
    pub fn empty(tag: &str) -> Self {
        Self {
            version: STATE_VERSION,
            tag: tag.to_string(),
            positions: BTreeMap::new(),
            liveness: LivenessMarker::default(),
        }
    }

    /// Canonical serialized form. Identical states give identical bytes.
    pub fn to_bytes(&self) -> TradingResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_bytes(tag: &str, bytes: &[u8]) -> TradingResult<Self> {
        let state: PersistedState = serde_json::from_slice(bytes)?;
        if state.version != STATE_VERSION {
            return Err(TradingError::StateCorrupt(format!(
                "unsupported state version {} (expected {})",
                state.version, STATE_VERSION
            )));
        }
        if state.tag != tag {
            return Err(TradingError::StateCorrupt(format!(
                "state belongs to tag '{}', not '{}'",
                state.tag, tag
            )));
        }
        Ok(state)
    }
}

/// Durable record of management state, one per strategy tag.
///
/// `save` is atomic: a later `load` sees either the previous snapshot or
/// the new one, never a mix.
pub trait PositionStateStore: Send + Sync {
    fn load(&self, tag: &str) -> TradingResult<Option<PersistedState>>;
    fn save(&self, tag: &str, state: &PersistedState) -> TradingResult<()>;
}

/// JSON file per tag, written by rename-over-temp-file in the same directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
    io_timeout: Duration,
    next_seq: Arc<AtomicU64>,
    /// Highest sequence number already on disk, guarded by the write lock
    written_seq: Arc<Mutex<u64>>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            io_timeout,
            next_seq: Arc::new(AtomicU64::new(1)),
            written_seq: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}.state.json", tag))
    }

    /// Run blocking file I/O on a helper thread and give up after `io_timeout`.
    /// A timed-out operation keeps running; writes carry a sequence number so
    /// a late one never overwrites a newer snapshot.
    fn bounded<T, F>(&self, op: F) -> TradingResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> TradingResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("state-io".to_string())
            .spawn(move || {
                let _ = tx.send(op());
            })
            .map_err(|e| TradingError::PersistenceIo(format!("cannot spawn I/O thread: {}", e)))?;

        match rx.recv_timeout(self.io_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(TradingError::PersistenceTimeout(self.io_timeout.as_millis() as u64))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TradingError::PersistenceIo(
                "state I/O thread exited without a result".to_string(),
            )),
        }
    }
}

impl PositionStateStore for JsonFileStore {
    fn load(&self, tag: &str) -> TradingResult<Option<PersistedState>> {
        let path = self.path_for(tag);
        let tag = tag.to_string();
        self.bounded(move || match fs::read(&path) {
            Ok(bytes) => PersistedState::from_bytes(&tag, &bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
    }

    fn save(&self, tag: &str, state: &PersistedState) -> TradingResult<()> {
        let bytes = state.to_bytes()?;
        let path = self.path_for(tag);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let written = Arc::clone(&self.written_seq);

        self.bounded(move || {
            let mut last = written.lock().unwrap_or_else(|e| e.into_inner());
            if *last > seq {
                debug!(seq, last = *last, "skipping superseded state write");
                return Ok(());
            }
            write_atomic(&path, &bytes)?;
            *last = seq;
            Ok(())
        })
    }
}

/// Replace `path` with `bytes` via a synced temp file in the same directory
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// In-memory store with failure injection, used by replays and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failures_left: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with a retryable I/O error
    pub fn fail_next_saves(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn raw(&self, tag: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
    }
}

impl PositionStateStore for MemoryStore {
    fn load(&self, tag: &str) -> TradingResult<Option<PersistedState>> {
        match self.raw(tag) {
            Some(bytes) => PersistedState::from_bytes(tag, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, tag: &str, state: &PersistedState) -> TradingResult<()> {
        let pending = self.failures_left.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_left.store(pending - 1, Ordering::SeqCst);
            return Err(TradingError::PersistenceIo("injected write failure".to_string()));
        }
        let bytes = state.to_bytes()?;
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string(), bytes);
        Ok(())
    }
}

/// What reconciliation against a broker snapshot changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Persisted positions the broker no longer reports
    pub orphans: Vec<u64>,
    /// Broker orders with our magic that were not tracked
    pub adopted: Vec<u64>,
    /// (ticket, old volume, new volume)
    pub resized: Vec<(u64, f64, f64)>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.orphans.is_empty() && self.adopted.is_empty() && self.resized.is_empty())
    }
}

/// Align tracked positions with the broker's open orders. Orders with a
/// different magic number belong to other instances and are ignored.
pub fn reconcile(
    positions: &mut BTreeMap<u64, ManagedPosition>,
    orders: &[BrokerOrder],
    tag: &str,
    magic: u64,
    adopt_unknown: bool,
) -> ReconcileReport {
    let ours: BTreeMap<u64, &BrokerOrder> = orders
        .iter()
        .filter(|o| o.magic == magic)
        .map(|o| (o.ticket, o))
        .collect();

    let mut report = ReconcileReport::default();

    positions.retain(|ticket, position| {
        if ours.contains_key(ticket) {
            return true;
        }
        warn!(
            tag,
            symbol = %position.symbol,
            ticket = *ticket,
            reason = "no matching broker order",
            "♻️  Recovered orphan: dropping position closed while offline"
        );
        report.orphans.push(*ticket);
        false
    });

    for (ticket, order) in &ours {
        match positions.get_mut(ticket) {
            Some(position) => {
                if (order.volume - position.volume).abs() < 1e-9 {
                    continue;
                }
                let before = position.volume;
                if position.shrink_to(order.volume) {
                    info!(
                        tag,
                        symbol = %position.symbol,
                        ticket = *ticket,
                        from = before,
                        to = order.volume,
                        "📉 Broker reports smaller volume, updating position"
                    );
                    report.resized.push((*ticket, before, order.volume));
                } else {
                    warn!(
                        tag,
                        symbol = %position.symbol,
                        ticket = *ticket,
                        tracked = before,
                        reported = order.volume,
                        "⚠️  Broker reports a larger volume than tracked; keeping tracked volume"
                    );
                }
            }
            None if adopt_unknown => {
                info!(
                    tag,
                    symbol = %order.symbol,
                    ticket = *ticket,
                    volume = order.volume,
                    "🧲 Adopting broker order carrying our magic number"
                );
                positions.insert(*ticket, ManagedPosition::from_broker_order(order, tag));
                report.adopted.push(*ticket);
            }
            None => {
                debug!(tag, ticket = *ticket, "untracked broker order left alone");
            }
        }
    }

    report
}
