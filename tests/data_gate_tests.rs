// Integration tests for bar validation, gap detection and de-duplication

mod common;

use bridge_trader::config::DataConfig;
use bridge_trader::core::data_gate::{BarVerdict, DataIntegrityGate, RejectReason};
use bridge_trader::types::Timeframe;
use common::*;

fn m1_gate() -> DataIntegrityGate {
    DataIntegrityGate::new("EURUSD", Timeframe::Minutes(1).as_duration(), &DataConfig::default())
}

#[test]
fn test_high_below_low_is_rejected() {
    let mut gate = m1_gate();
    let mut bar = bar_at(0, 1.1000);
    std::mem::swap(&mut bar.high, &mut bar.low);

    assert_eq!(gate.check(&bar), BarVerdict::Rejected(RejectReason::HighBelowLow));
    let rejected: Vec<_> = gate.rejected().collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].bar, bar);
}

#[test]
fn test_five_period_gap_warns_exactly_once() {
    let mut gate = m1_gate();
    let mut warnings = 0;

    let minutes = [0, 1, 2, 7, 8, 9, 10];
    for n in minutes {
        match gate.check(&bar_at(n, 1.1000)) {
            BarVerdict::Accepted { gap: Some(warning) } => {
                warnings += 1;
                assert_eq!(warning.previous, minute(2));
                assert_eq!(warning.current, minute(7));
                assert_eq!(warning.missing_bars, 4);
            }
            BarVerdict::Accepted { gap: None } => {}
            other => panic!("bar {} not accepted: {:?}", n, other),
        }
    }

    assert_eq!(warnings, 1);
    assert_eq!(gate.gaps_seen(), 1);
    assert_eq!(gate.last_accepted(), Some(minute(10)));
}

#[test]
fn test_duplicates_keep_the_first_bar() {
    let mut gate = m1_gate();
    assert!(matches!(gate.check(&bar_at(0, 1.1000)), BarVerdict::Accepted { .. }));
    assert_eq!(gate.check(&bar_at(0, 1.2000)), BarVerdict::Duplicate);
    assert_eq!(gate.check(&bar_at(0, 1.1000)), BarVerdict::Duplicate);
    assert!(matches!(gate.check(&bar_at(1, 1.1000)), BarVerdict::Accepted { gap: None }));
    assert_eq!(gate.rejected().count(), 0);
}

#[test]
fn test_small_jitter_is_not_a_gap() {
    let mut gate = m1_gate();
    gate.check(&bar_at(0, 1.1000));
    let mut late = bar_at(1, 1.1000);
    late.timestamp += chrono::Duration::seconds(20);
    assert!(matches!(gate.check(&late), BarVerdict::Accepted { gap: None }));
}
