// Two-way heartbeat protocol with the broker-side counterpart

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::LivenessConfig;
use crate::core::position_store::write_atomic;
use crate::error::TradingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LivenessStatus {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for LivenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessStatus::Alive => write!(f, "ALIVE"),
            LivenessStatus::Suspect => write!(f, "SUSPECT"),
            LivenessStatus::Dead => write!(f, "DEAD"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub started_at: DateTime<Utc>,
    pub last_received_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub status: LivenessStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTransition {
    Unchanged,
    BecameSuspect,
    BecameDead,
    Recovered { from: LivenessStatus },
}

/// Invoked once each time the counterpart is declared DEAD
pub type DeadCallback = Box<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// ALIVE / SUSPECT / DEAD state machine driven by explicit timestamps.
///
/// Silence is measured from the last received heartbeat, or from start-up
/// if none has arrived yet. `evaluate` only moves towards DEAD; only
/// `observe_heartbeat` brings the status back to ALIVE.
pub struct LivenessMonitor {
    interval: Duration,
    timeout: Duration,
    dead_after: Duration,
    state: HeartbeatState,
    on_dead: Option<DeadCallback>,
}

impl fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("dead_after", &self.dead_after)
            .field("state", &self.state)
            .field("has_callback", &self.on_dead.is_some())
            .finish()
    }
}

fn millis(value: f64) -> Duration {
    Duration::milliseconds(value.round() as i64)
}

impl LivenessMonitor {
    pub fn new(config: &LivenessConfig, started_at: DateTime<Utc>) -> Self {
        let interval_ms = config.interval_secs as f64 * 1000.0;
        let timeout_ms = interval_ms * config.timeout_multiplier;
        Self {
            interval: millis(interval_ms),
            timeout: millis(timeout_ms),
            dead_after: millis(timeout_ms * config.grace_multiplier),
            state: HeartbeatState {
                started_at,
                last_received_at: None,
                last_sent_at: None,
                status: LivenessStatus::Alive,
            },
            on_dead: None,
        }
    }

    pub fn with_dead_callback(mut self, callback: DeadCallback) -> Self {
        self.on_dead = Some(callback);
        self
    }

    pub fn state(&self) -> &HeartbeatState {
        &self.state
    }

    pub fn status(&self) -> LivenessStatus {
        self.state.status
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a heartbeat from the counterpart
    pub fn observe_heartbeat(&mut self, at: DateTime<Utc>) -> LivenessTransition {
        if let Some(last) = self.state.last_received_at {
            if at < last {
                debug!("ignoring out-of-date heartbeat stamped {}", at);
                return LivenessTransition::Unchanged;
            }
        }
        self.state.last_received_at = Some(at);

        let previous = self.state.status;
        if previous == LivenessStatus::Alive {
            return LivenessTransition::Unchanged;
        }
        self.state.status = LivenessStatus::Alive;
        info!("💚 Counterpart heartbeat resumed ({} → ALIVE)", previous);
        LivenessTransition::Recovered { from: previous }
    }

    /// Re-check silence at `now`, firing the DEAD callback on entry to DEAD
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> LivenessTransition {
        let since = self.state.last_received_at.unwrap_or(self.state.started_at);
        let silence = now - since;

        let target = if silence > self.dead_after {
            LivenessStatus::Dead
        } else if silence > self.timeout {
            LivenessStatus::Suspect
        } else {
            LivenessStatus::Alive
        };

        match (self.state.status, target) {
            (LivenessStatus::Alive, LivenessStatus::Suspect) => {
                self.state.status = LivenessStatus::Suspect;
                warn!(
                    "⚠️  Counterpart heartbeat overdue ({}s silent), status SUSPECT",
                    silence.num_seconds()
                );
                LivenessTransition::BecameSuspect
            }
            (LivenessStatus::Alive | LivenessStatus::Suspect, LivenessStatus::Dead) => {
                self.state.status = LivenessStatus::Dead;
                error!(
                    "💀 Counterpart silent for {}s, status DEAD",
                    silence.num_seconds()
                );
                if let Some(callback) = &self.on_dead {
                    callback(now);
                }
                LivenessTransition::BecameDead
            }
            _ => LivenessTransition::Unchanged,
        }
    }

    /// Is an outbound heartbeat due at `now`?
    pub fn emit_due(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_sent_at {
            Some(last) => now - last >= self.interval,
            None => true,
        }
    }

    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.state.last_sent_at = Some(at);
    }
}

/// Where outbound heartbeats are written for the counterpart to see
pub trait HeartbeatSink: Send {
    fn emit(&mut self, at: DateTime<Utc>) -> TradingResult<()>;

    /// Withdraw the heartbeat so no stale ALIVE marker outlives the process
    fn retire(&mut self) -> TradingResult<()>;
}

/// Heartbeat marker file holding the last emission time
#[derive(Debug, Clone)]
pub struct FileHeartbeatSink {
    path: PathBuf,
}

impl FileHeartbeatSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl HeartbeatSink for FileHeartbeatSink {
    fn emit(&mut self, at: DateTime<Utc>) -> TradingResult<()> {
        let line = format!("{}\n", at.timestamp_millis());
        write_atomic(&self.path, line.as_bytes())?;
        Ok(())
    }

    fn retire(&mut self) -> TradingResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("🫀 Heartbeat file removed: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sink that keeps emissions in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryHeartbeatSink {
    emitted: Arc<Mutex<Vec<DateTime<Utc>>>>,
    retired: Arc<Mutex<bool>>,
}

impl MemoryHeartbeatSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<DateTime<Utc>> {
        self.emitted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_retired(&self) -> bool {
        *self.retired.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HeartbeatSink for MemoryHeartbeatSink {
    fn emit(&mut self, at: DateTime<Utc>) -> TradingResult<()> {
        self.emitted.lock().unwrap_or_else(|e| e.into_inner()).push(at);
        Ok(())
    }

    fn retire(&mut self) -> TradingResult<()> {
        *self.retired.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(())
    }
}
