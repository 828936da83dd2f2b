// Async runtime around the trade manager: event processing, heartbeats, safety flatten

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::LivenessConfig;
use crate::core::liveness::{HeartbeatSink, LivenessMonitor, LivenessStatus, LivenessTransition};
use crate::core::trade_manager::{FlattenReport, TradeManager};
use crate::error::{TradingError, TradingResult};
use crate::transport::BrokerEvent;
use crate::types::Clock;

type SharedManager = Arc<Mutex<TradeManager>>;
type SharedMonitor = Arc<StdMutex<LivenessMonitor>>;

fn lock_monitor(monitor: &StdMutex<LivenessMonitor>) -> MutexGuard<'_, LivenessMonitor> {
    monitor.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run a closure against the manager on the blocking pool. The manager's
/// work includes synchronous persistence, so it never runs on a runtime
/// worker that the heartbeat task might need.
async fn with_manager<T, F>(manager: &SharedManager, f: F) -> TradingResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut TradeManager) -> T + Send + 'static,
{
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || {
        let mut guard = manager.blocking_lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| TradingError::Internal(format!("manager task failed: {}", e)))
}

/// Two activity streams: broker events applied one at a time, and a
/// heartbeat timer that keeps ticking regardless of how long an event takes.
pub struct TradingEngine {
    manager: SharedManager,
    monitor: SharedMonitor,
    dead_rx: mpsc::UnboundedReceiver<DateTime<Utc>>,
    sink: Option<Box<dyn HeartbeatSink>>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    flatten_retry: Duration,
}

impl TradingEngine {
    /// `manager` should already have run `recover`.
    pub fn new(manager: TradeManager, liveness: &LivenessConfig, clock: Arc<dyn Clock>) -> Self {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let monitor = LivenessMonitor::new(liveness, clock.now()).with_dead_callback(Box::new(
            move |at| {
                let _ = dead_tx.send(at);
            },
        ));

        // Evaluate a few times per interval so transitions are seen promptly
        let tick = (liveness.interval() / 4).max(Duration::from_millis(10));

        Self {
            manager: Arc::new(Mutex::new(manager)),
            monitor: Arc::new(StdMutex::new(monitor)),
            dead_rx,
            sink: None,
            clock,
            tick,
            flatten_retry: liveness.interval(),
        }
    }

    pub fn with_heartbeat_sink(mut self, sink: Box<dyn HeartbeatSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// How often the heartbeat task wakes up
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_flatten_retry(mut self, every: Duration) -> Self {
        self.flatten_retry = every;
        self
    }

    pub fn manager(&self) -> SharedManager {
        Arc::clone(&self.manager)
    }

    pub fn liveness_status(&self) -> LivenessStatus {
        lock_monitor(&self.monitor).status()
    }

    /// Process events until `shutdown` flips (or its sender goes away) or the
    /// event stream ends. The event in flight is always finished, the
    /// heartbeat marker withdrawn, and a final save made before returning.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<BrokerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> TradingResult<()> {
        let TradingEngine {
            manager,
            monitor,
            dead_rx,
            sink,
            clock,
            tick,
            flatten_retry,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&monitor),
            sink,
            Arc::clone(&clock),
            tick,
            stop_rx.clone(),
        ));
        let flatten = tokio::spawn(flatten_worker(
            Arc::clone(&manager),
            Arc::clone(&monitor),
            dead_rx,
            flatten_retry,
            stop_rx,
        ));
        info!("🚀 Trading engine started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("🛑 Shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => process_event(&manager, &monitor, clock.as_ref(), event).await,
                    None => {
                        info!("📭 Event stream closed");
                        break;
                    }
                },
            }
        }

        let _ = stop_tx.send(true);
        if let Err(e) = flatten.await {
            error!("Flatten worker ended abnormally: {}", e);
        }
        retire_heartbeat(heartbeat).await;

        let saved = with_manager(&manager, |m| m.shutdown()).await?;
        if let Err(e) = &saved {
            error!("❌ Final state save failed: {}", e);
        } else {
            info!("✅ Trading engine stopped cleanly");
        }
        saved
    }
}

async fn process_event(
    manager: &SharedManager,
    monitor: &SharedMonitor,
    clock: &dyn Clock,
    event: BrokerEvent,
) {
    // Anything the counterpart sends proves it is alive
    let transition = lock_monitor(monitor).observe_heartbeat(clock.now());
    if let LivenessTransition::Recovered { .. } = transition {
        if let Err(e) = with_manager(manager, |m| m.on_counterpart_alive()).await {
            error!("{}", e);
        }
    }
    if matches!(event, BrokerEvent::Heartbeat { .. }) {
        debug!("heartbeat received");
        return;
    }

    let kind = event.kind();
    match with_manager(manager, move |m| m.handle_event(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(event = kind, category = e.category(), "⚠️  Event handling failed: {}", e),
        Err(e) => error!(event = kind, "❌ {}", e),
    }
}

async fn heartbeat_loop(
    monitor: SharedMonitor,
    mut sink: Option<Box<dyn HeartbeatSink>>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
) -> Option<Box<dyn HeartbeatSink>> {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = clock.now();
                let due = {
                    let mut monitor = lock_monitor(&monitor);
                    monitor.evaluate(now);
                    monitor.emit_due(now)
                };
                if !due {
                    continue;
                }
                let emitted = match sink.as_mut() {
                    Some(sink) => sink.emit(now),
                    None => Ok(()),
                };
                match emitted {
                    Ok(()) => lock_monitor(&monitor).mark_sent(now),
                    Err(e) => warn!("⚠️  Heartbeat emission failed: {}", e),
                }
            }
            _ = stop.changed() => break,
        }
    }
    sink
}

async fn retire_heartbeat(heartbeat: JoinHandle<Option<Box<dyn HeartbeatSink>>>) {
    match heartbeat.await {
        Ok(Some(mut sink)) => {
            if let Err(e) = sink.retire() {
                warn!("⚠️  Could not withdraw heartbeat marker: {}", e);
            }
        }
        Ok(None) => {}
        Err(e) => error!("Heartbeat task ended abnormally: {}", e),
    }
}

/// Apply a queued DEAD notice only if the counterpart is still DEAD.
///
/// Runs under the manager lock. Recovery clears the halt under the same
/// lock after updating the monitor, so a notice that lost the race to a
/// recovery is dropped instead of leaving opens halted for good.
fn flatten_if_still_dead(
    manager: &mut TradeManager,
    monitor: &StdMutex<LivenessMonitor>,
    at: DateTime<Utc>,
) -> Option<FlattenReport> {
    let status = lock_monitor(monitor).status();
    if status != LivenessStatus::Dead {
        info!(%status, dead_at = %at, "Counterpart recovered before the DEAD notice was handled; not flattening");
        return None;
    }
    Some(manager.on_counterpart_dead(at))
}

async fn flatten_worker(
    manager: SharedManager,
    monitor: SharedMonitor,
    mut dead_rx: mpsc::UnboundedReceiver<DateTime<Utc>>,
    retry_every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let at = tokio::select! {
            at = dead_rx.recv() => match at {
                Some(at) => at,
                None => break,
            },
            _ = stop.changed() => break,
        };

        let still_dead = Arc::clone(&monitor);
        let mut report: FlattenReport =
            match with_manager(&manager, move |m| flatten_if_still_dead(m, &still_dead, at)).await {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    error!("{}", e);
                    continue;
                }
            };

        while !report.is_complete() {
            tokio::select! {
                _ = sleep(retry_every) => {}
                _ = stop.changed() => return,
            }
            if lock_monitor(&monitor).status() != LivenessStatus::Dead {
                info!("Counterpart back before flatten completed; stopping retries");
                break;
            }
            warn!(failed = report.failed.len(), "🔁 Retrying flatten-all");
            report = match with_manager(&manager, |m| m.flatten_all("counterpart dead (retry)")).await {
                Ok(report) => report,
                Err(e) => {
                    error!("{}", e);
                    break;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::position_store::MemoryStore;
    use crate::core::error_handling::{HaltReason, RetryPolicy};
    use crate::strategy::StrategyRegistry;
    use crate::transport::RecordingTransport;
    use chrono::TimeZone;

    fn manager() -> TradeManager {
        let mut manager = TradeManager::new(
            &Config::default(),
            &StrategyRegistry::with_builtins(),
            Box::new(MemoryStore::new()),
            Box::new(RecordingTransport::new()),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::no_retry());
        manager.recover().unwrap();
        manager
    }

    #[test]
    fn test_dead_notice_after_recovery_is_dropped() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        let mut manager = manager();
        let monitor = StdMutex::new(LivenessMonitor::new(&LivenessConfig::default(), start));

        // DEAD, then a heartbeat arrives before the queued notice is handled
        let dead_at = start + chrono::Duration::seconds(120);
        assert_eq!(lock_monitor(&monitor).evaluate(dead_at), LivenessTransition::BecameDead);
        let back = lock_monitor(&monitor).observe_heartbeat(dead_at + chrono::Duration::seconds(1));
        assert!(matches!(back, LivenessTransition::Recovered { .. }));
        manager.on_counterpart_alive();

        assert!(flatten_if_still_dead(&mut manager, &monitor, dead_at).is_none());
        assert!(!manager.is_halted());
        assert_eq!(manager.liveness_marker().dead_episodes, 0);
    }

    #[test]
    fn test_dead_notice_flattens_while_still_dead() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        let mut manager = manager();
        let monitor = StdMutex::new(LivenessMonitor::new(&LivenessConfig::default(), start));

        let dead_at = start + chrono::Duration::seconds(120);
        lock_monitor(&monitor).evaluate(dead_at);

        let report = flatten_if_still_dead(&mut manager, &monitor, dead_at);
        assert!(report.is_some_and(|r| r.is_complete()));
        assert!(manager.halt_reasons().contains(&HaltReason::CounterpartDead));
    }
}
