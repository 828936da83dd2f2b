// Broker-reported per-symbol trading constraints and their cache

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TradingError, TradingResult};

/// Trading constraints for one symbol as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    /// Minimum distance between market price and a stop, in price units
    pub stop_level: f64,
    pub digits: u32,
    /// Account-currency value of one point move for one lot
    pub tick_value: f64,
}

impl InstrumentRules {
    /// Smallest price increment, 10^-digits
    pub fn point(&self) -> f64 {
        10f64.powi(-(self.digits as i32))
    }

    /// Account-currency value of a 1.0 price move for one lot
    pub fn value_per_unit(&self) -> f64 {
        self.tick_value / self.point()
    }

    /// Round a price to the instrument's precision
    pub fn normalize_price(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.digits as i32);
        (price * factor).round() / factor
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.lot_step > 0.0) {
            return Err("lot_step must be positive".to_string());
        }
        if !(self.min_lot > 0.0) || self.max_lot < self.min_lot {
            return Err("lot bounds must satisfy 0 < min_lot <= max_lot".to_string());
        }
        if self.stop_level < 0.0 {
            return Err("stop_level must be non-negative".to_string());
        }
        if !(self.tick_value > 0.0) {
            return Err("tick_value must be positive".to_string());
        }
        if self.digits > 10 {
            return Err("digits must be at most 10".to_string());
        }
        Ok(())
    }
}

/// Synchronous, bounded way of asking the broker side for fresh rules
pub trait InstrumentSource: Send {
    fn fetch(&self, symbol: &str, timeout: Duration) -> TradingResult<InstrumentRules>;
}

/// Source used when rules only arrive as pushed broker events
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOnlySource;

impl InstrumentSource for PushOnlySource {
    fn fetch(&self, symbol: &str, _timeout: Duration) -> TradingResult<InstrumentRules> {
        Err(TradingError::InstrumentRulesUnavailable {
            symbol: symbol.to_string(),
            reason: "no synchronous source; waiting for the counterpart to push rules".to_string(),
        })
    }
}

/// Fixed table of rules, used by the paper broker and tests
#[derive(Debug, Clone, Default)]
pub struct StaticInstrumentSource {
    rules: BTreeMap<String, InstrumentRules>,
}

impl StaticInstrumentSource {
    pub fn new(rules: BTreeMap<String, InstrumentRules>) -> Self {
        Self { rules }
    }
}

impl InstrumentSource for StaticInstrumentSource {
    fn fetch(&self, symbol: &str, _timeout: Duration) -> TradingResult<InstrumentRules> {
        self.rules
            .get(symbol)
            .copied()
            .ok_or_else(|| TradingError::InstrumentRulesUnavailable {
                symbol: symbol.to_string(),
                reason: "symbol not in static rules table".to_string(),
            })
    }
}

/// Rules the counterpart writes to `<dir>/<SYMBOL>.json`.
///
/// A fetch polls for a file younger than `max_age` on a helper thread and
/// gives up after the caller's timeout; the thread stops polling at the
/// same deadline.
#[derive(Debug, Clone)]
pub struct FileInstrumentSource {
    dir: PathBuf,
    max_age: Duration,
    poll: Duration,
}

impl FileInstrumentSource {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            poll: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", symbol))
    }
}

fn unavailable(symbol: &str, reason: impl Into<String>) -> TradingError {
    TradingError::InstrumentRulesUnavailable {
        symbol: symbol.to_string(),
        reason: reason.into(),
    }
}

/// `None` while the file is absent or older than `max_age`
fn read_fresh_rules(path: &Path, symbol: &str, max_age: Duration) -> TradingResult<Option<InstrumentRules>> {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(unavailable(symbol, e.to_string())),
    };
    let age = SystemTime::now().duration_since(modified).unwrap_or_default();
    if age > max_age {
        return Ok(None);
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(unavailable(symbol, e.to_string())),
    };
    let rules: InstrumentRules = serde_json::from_slice(&bytes)
        .map_err(|e| unavailable(symbol, format!("malformed rules file: {}", e)))?;
    rules.validate().map_err(|reason| unavailable(symbol, reason))?;
    Ok(Some(rules))
}

impl InstrumentSource for FileInstrumentSource {
    fn fetch(&self, symbol: &str, timeout: Duration) -> TradingResult<InstrumentRules> {
        let path = self.path_for(symbol);
        let owned_symbol = symbol.to_string();
        let max_age = self.max_age;
        let poll = self.poll;
        let deadline = Instant::now() + timeout;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("rules-io".to_string())
            .spawn(move || loop {
                match read_fresh_rules(&path, &owned_symbol, max_age) {
                    Ok(Some(rules)) => {
                        let _ = tx.send(Ok(rules));
                        return;
                    }
                    Ok(None) if Instant::now() < deadline => std::thread::sleep(poll),
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            })
            .map_err(|e| unavailable(symbol, format!("cannot spawn I/O thread: {}", e)))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            // The poller gave up at the deadline without a file
            Err(mpsc::RecvTimeoutError::Timeout) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!(symbol, timeout_ms = timeout.as_millis() as u64, "no fresh rules file");
                Err(TradingError::InstrumentRefreshTimeout(symbol.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    rules: InstrumentRules,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RulesLookup {
    Fresh(InstrumentRules),
    Stale { rules: InstrumentRules, age: Duration },
    Missing,
}

/// Lazily populated rules per symbol. Entries are never invented: they only
/// come from the broker and leave only through `invalidate`.
#[derive(Debug, Clone)]
pub struct InstrumentRulesCache {
    max_age: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl InstrumentRulesCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, symbol: impl Into<String>, rules: InstrumentRules, fetched_at: DateTime<Utc>) {
        let symbol = symbol.into();
        debug!(symbol = %symbol, ?rules, "instrument rules cached");
        self.entries.insert(symbol, CacheEntry { rules, fetched_at });
    }

    pub fn lookup(&self, symbol: &str, now: DateTime<Utc>) -> RulesLookup {
        let Some(entry) = self.entries.get(symbol) else {
            return RulesLookup::Missing;
        };
        let age = (now - entry.fetched_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.max_age {
            RulesLookup::Stale {
                rules: entry.rules,
                age,
            }
        } else {
            RulesLookup::Fresh(entry.rules)
        }
    }

    /// Last known rules regardless of age
    pub fn last_known(&self, symbol: &str) -> Option<InstrumentRules> {
        self.entries.get(symbol).map(|e| e.rules)
    }

    pub fn invalidate(&mut self, symbol: &str) {
        self.entries.remove(symbol);
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}
