// Integration tests for crash-safe position state across restarts

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bridge_trader::core::error_handling::{HaltReason, RetryPolicy};
use bridge_trader::core::position_store::JsonFileStore;
use bridge_trader::strategy::StrategyRegistry;
use bridge_trader::transport::RecordingTransport;
use bridge_trader::types::{Direction, ManualClock};
use bridge_trader::{Config, TradeManager, TradingError};
use common::*;
use tempfile::TempDir;

fn file_manager(config: &Config, dir: &Path) -> (TradeManager, JsonFileStore, RecordingTransport) {
    let store = JsonFileStore::new(dir, Duration::from_secs(2));
    let transport = RecordingTransport::new();
    let manager = TradeManager::new(
        config,
        &StrategyRegistry::with_builtins(),
        Box::new(store.clone()),
        Box::new(transport.clone()),
    )
    .expect("manager should build")
    .with_clock(Arc::new(ManualClock::new(start_time())))
    .with_retry_policy(RetryPolicy::no_retry());
    (manager, store, transport)
}

#[test]
fn test_state_is_byte_stable_across_restarts() {
    let config = with_partial_stages(create_test_config());
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let broker_view = vec![
        broker_order(1, Direction::Buy, 0.20, 1.1002),
        broker_order(2, Direction::Sell, 0.10, 1.1000),
    ];

    let (mut manager, store, _) = file_manager(&config, temp_dir.path());
    manager.recover().unwrap();
    manager.on_open_orders(&broker_view).unwrap();
    manager.on_account(account(10_000.0));
    manager.on_instrument_rules("EURUSD", eurusd_rules());
    // Fire the first stage of ticket 1 so the file carries stage history
    manager.on_price_update("EURUSD", 1.1015, 1.1017, minute(1)).unwrap();
    manager.shutdown().unwrap();
    drop(manager);

    let path = store.path_for("test-eurusd");
    let original = fs::read(&path).expect("state file written");

    for _ in 0..5 {
        let (mut manager, _, transport) = file_manager(&config, temp_dir.path());
        assert_eq!(manager.recover().unwrap(), 2);
        let report = manager.on_open_orders(&broker_view).unwrap();
        assert!(!report.changed());
        manager.shutdown().unwrap();
        assert!(transport.requests().is_empty());
        assert_eq!(fs::read(&path).unwrap(), original);
    }

    // Only the state file remains; no temp files left behind
    let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_reconciliation_drops_exactly_the_orphans() {
    let config = create_test_config();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let (mut manager, _, _) = file_manager(&config, temp_dir.path());
    manager.recover().unwrap();
    let all: Vec<_> = (1..=5)
        .map(|ticket| broker_order(ticket, Direction::Buy, 0.10, 1.1000))
        .collect();
    manager.on_open_orders(&all).unwrap();
    manager.shutdown().unwrap();
    drop(manager);

    // Tickets 2 and 4 were closed while the process was down
    let survivors: Vec<_> = all
        .iter()
        .filter(|o| o.ticket != 2 && o.ticket != 4)
        .cloned()
        .collect();
    let (mut manager, _, _) = file_manager(&config, temp_dir.path());
    assert_eq!(manager.recover().unwrap(), 5);
    let report = manager.on_open_orders(&survivors).unwrap();

    assert_eq!(report.orphans, vec![2, 4]);
    assert!(report.adopted.is_empty());
    assert_eq!(manager.positions().keys().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
}

#[test]
fn test_unreadable_state_halts_opens_until_snapshot() {
    let config = create_test_config();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (mut manager, store, transport) = file_manager(&config, temp_dir.path());
    fs::write(store.path_for("test-eurusd"), b"{ not json").unwrap();

    assert!(manager.recover().is_err());
    assert_eq!(manager.halt_reasons(), vec![HaltReason::StateUnreadable]);

    manager.on_account(account(10_000.0));
    manager.on_instrument_rules("EURUSD", eurusd_rules());
    manager.on_price_update("EURUSD", 1.1000, 1.1002, minute(0)).unwrap();
    assert!(matches!(
        manager.open_position(Direction::Buy, "EURUSD"),
        Err(TradingError::OpensHalted(_))
    ));

    let report = manager
        .on_open_orders(&[broker_order(7, Direction::Buy, 0.10, 1.1000)])
        .unwrap();
    assert_eq!(report.adopted, vec![7]);
    assert!(!manager.is_halted());
    assert!(manager.is_ready());

    // The broken file has been replaced by a readable one
    let (mut restarted, _, _) = file_manager(&config, temp_dir.path());
    assert_eq!(restarted.recover().unwrap(), 1);

    assert!(transport.requests().is_empty());
}

#[test]
fn test_liveness_history_survives_restart() {
    let config = create_test_config();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let (mut manager, _, _) = file_manager(&config, temp_dir.path());
    manager.recover().unwrap();
    manager.on_counterpart_dead(minute(3));
    drop(manager);

    let (mut manager, _, _) = file_manager(&config, temp_dir.path());
    manager.recover().unwrap();
    assert_eq!(manager.liveness_marker().dead_episodes, 1);
    assert_eq!(manager.liveness_marker().last_dead_at, Some(minute(3)));
    // Death is not carried over as a halt; a fresh process waits for its own evidence
    assert!(!manager.is_halted());
}

#[test]
fn test_tags_do_not_share_state() {
    let mut config = create_test_config();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let (mut manager, _, _) = file_manager(&config, temp_dir.path());
    manager.recover().unwrap();
    manager
        .on_open_orders(&[broker_order(1, Direction::Buy, 0.10, 1.1000)])
        .unwrap();
    drop(manager);

    config.strategy.tag = "other-instance".to_string();
    let (mut other, _, _) = file_manager(&config, temp_dir.path());
    assert_eq!(other.recover().unwrap(), 0);
    assert!(other.is_ready());
}
