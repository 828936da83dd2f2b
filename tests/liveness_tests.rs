// Heartbeat timelines: silence, death and recovery over simulated seconds

mod common;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bridge_trader::config::LivenessConfig;
use bridge_trader::core::liveness::{
    FileHeartbeatSink, HeartbeatSink, LivenessMonitor, LivenessStatus, LivenessTransition,
};
use chrono::Duration;
use common::*;
use tempfile::TempDir;

/// Drive a monitor second by second; the counterpart beats every 15s while `beating` says so
fn run_timeline(
    monitor: &mut LivenessMonitor,
    seconds: i64,
    beating: impl Fn(i64) -> bool,
) -> Vec<(i64, LivenessTransition)> {
    let mut transitions = Vec::new();
    for s in 1..=seconds {
        let now = start_time() + Duration::seconds(s);
        if beating(s) && s % 15 == 0 {
            let t = monitor.observe_heartbeat(now);
            if t != LivenessTransition::Unchanged {
                transitions.push((s, t));
            }
        }
        let t = monitor.evaluate(now);
        if t != LivenessTransition::Unchanged {
            transitions.push((s, t));
        }
    }
    transitions
}

#[test]
fn test_silence_goes_suspect_then_dead_exactly_once() {
    let deaths = Arc::new(AtomicUsize::new(0));
    let counter = deaths.clone();
    let mut monitor = LivenessMonitor::new(&LivenessConfig::default(), start_time())
        .with_dead_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    // Last beat at 30s, then silence for the rest of a long run
    let transitions = run_timeline(&mut monitor, 600, |s| s <= 30);

    // Timeout is 30s and DEAD follows after 90s of silence
    assert_eq!(
        transitions,
        vec![
            (61, LivenessTransition::BecameSuspect),
            (121, LivenessTransition::BecameDead),
        ]
    );
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.status(), LivenessStatus::Dead);
}

#[test]
fn test_each_dead_episode_fires_once() {
    let deaths = Arc::new(AtomicUsize::new(0));
    let counter = deaths.clone();
    let mut monitor = LivenessMonitor::new(&LivenessConfig::default(), start_time())
        .with_dead_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    // Silent from start-up until 300s, beats until 450s, then silent again
    let transitions = run_timeline(&mut monitor, 900, |s| (300..=450).contains(&s));
    let recoveries = transitions
        .iter()
        .filter(|(_, t)| matches!(t, LivenessTransition::Recovered { .. }))
        .count();

    assert_eq!(deaths.load(Ordering::SeqCst), 2);
    assert_eq!(recoveries, 1);
    assert!(transitions.contains(&(
        300,
        LivenessTransition::Recovered {
            from: LivenessStatus::Dead
        }
    )));
}

#[test]
fn test_regular_beats_stay_alive() {
    let mut monitor = LivenessMonitor::new(&LivenessConfig::default(), start_time());
    let transitions = run_timeline(&mut monitor, 3_600, |_| true);
    assert!(transitions.is_empty());
    assert_eq!(monitor.status(), LivenessStatus::Alive);
    assert_eq!(
        monitor.state().last_received_at,
        Some(start_time() + Duration::seconds(3_600))
    );
}

#[test]
fn test_file_sink_writes_millis_and_retires() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("heartbeat.txt");
    let mut sink = FileHeartbeatSink::new(path.clone());

    sink.emit(minute(2)).unwrap();
    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.trim(), minute(2).timestamp_millis().to_string());

    sink.retire().unwrap();
    assert!(!path.exists());
    // Retiring twice is harmless
    sink.retire().unwrap();
}
