// Integration tests for sizing and protective level placement

mod common;

use bridge_trader::config::{LevelSpec, RiskConfig};
use bridge_trader::core::instruments::InstrumentRules;
use bridge_trader::core::risk::RiskCalculator;
use bridge_trader::types::{Direction, Quote};
use bridge_trader::TradingError;
use common::*;

fn calculator() -> RiskCalculator {
    RiskCalculator::new(create_test_config().risk)
}

fn quote(bid: f64, ask: f64) -> Quote {
    Quote {
        bid,
        ask,
        at: start_time(),
    }
}

#[test]
fn test_reference_sizing_scenario() {
    let volume = calculator()
        .position_size(10_000.0, 0.01, 0.0050, &eurusd_rules())
        .unwrap();
    assert!((volume - 0.20).abs() < 1e-12);
}

#[test]
fn test_size_is_a_lot_step_multiple_within_bounds_or_below_minimum() {
    let calculator = calculator();
    let rules_set = [
        eurusd_rules(),
        InstrumentRules {
            min_lot: 0.1,
            max_lot: 5.0,
            lot_step: 0.1,
            stop_level: 0.01,
            digits: 3,
            tick_value: 0.5,
        },
        InstrumentRules {
            min_lot: 1.0,
            max_lot: 1000.0,
            lot_step: 1.0,
            stop_level: 0.5,
            digits: 2,
            tick_value: 0.01,
        },
    ];

    for rules in &rules_set {
        for equity in [50.0, 1_000.0, 10_000.0, 250_000.0, 5_000_000.0] {
            for risk in [0.001, 0.005, 0.01, 0.05] {
                for stop in [0.0005, 0.003, 0.05, 1.7, 25.0] {
                    match calculator.position_size(equity, risk, stop, rules) {
                        Ok(volume) => {
                            let steps = volume / rules.lot_step;
                            assert!((steps - steps.round()).abs() < 1e-6, "{} not a step multiple", volume);
                            assert!(volume >= rules.min_lot - 1e-9 && volume <= rules.max_lot + 1e-9);
                        }
                        Err(TradingError::BelowMinimumLot { computed, min_lot }) => {
                            assert!(computed < min_lot);
                        }
                        Err(other) => panic!("unexpected error {:?}", other),
                    }
                }
            }
        }
    }
}

#[test]
fn test_invalid_sizing_inputs_are_rejected() {
    let calculator = calculator();
    let rules = eurusd_rules();
    assert!(calculator.position_size(0.0, 0.01, 0.005, &rules).is_err());
    assert!(calculator.position_size(10_000.0, 0.01, 0.0, &rules).is_err());
    assert!(calculator.position_size(10_000.0, 1.5, 0.005, &rules).is_err());
    assert!(calculator.position_size(f64::NAN, 0.01, 0.005, &rules).is_err());
}

#[test]
fn test_levels_respect_the_broker_stop_level() {
    let mut config = create_test_config().risk;
    config.stop_loss = LevelSpec::PriceDistance(0.0001);
    config.take_profit = Some(LevelSpec::PriceDistance(0.0001));
    let calculator = RiskCalculator::new(config);
    let rules = eurusd_rules();
    let market = quote(1.1000, 1.1002);

    for direction in [Direction::Buy, Direction::Sell] {
        let stop = calculator.stop_loss_level(direction, &market, &rules).unwrap();
        let target = calculator
            .take_profit_level(direction, &market, 10_000.0, 0.2, &rules)
            .unwrap()
            .expect("take profit configured");
        assert!(stop.widened && target.widened);

        let exit = direction.exit_price(&market);
        let min_distance = calculator.min_stop_distance(&rules);
        assert!((exit - stop.price).abs() >= min_distance - 1e-12);
        assert!((target.price - exit).abs() >= min_distance - 1e-12);
        // Stop on the losing side, target on the winning side
        assert!(direction.sign() * (exit - stop.price) > 0.0);
        assert!(direction.sign() * (target.price - exit) > 0.0);
    }
}

#[test]
fn test_levels_are_rounded_to_instrument_digits() {
    let config = RiskConfig {
        stop_loss: LevelSpec::PriceFraction(0.00123),
        ..create_test_config().risk
    };
    let calculator = RiskCalculator::new(config);
    let stop = calculator
        .stop_loss_level(Direction::Buy, &quote(1.23456, 1.23470), &eurusd_rules())
        .unwrap();
    let scaled = stop.price * 1e5;
    assert!((scaled - scaled.round()).abs() < 1e-6);
}

#[test]
fn test_trailing_stop_is_monotonic_over_favourable_moves() {
    let calculator = calculator();
    let mut mark = 1.1000;
    let mut stop = None;
    let mut previous: Option<f64> = None;

    for bid in [1.1005, 1.1012, 1.1009, 1.1030, 1.1021, 1.1060, 1.1060, 1.1001] {
        let trail = calculator.trailing_stop_level(Direction::Buy, bid, mark, 0.001, stop);
        if let Some(prev) = previous {
            assert!(trail.stop >= prev, "stop loosened from {} to {}", prev, trail.stop);
        }
        assert!(trail.high_water_mark >= mark);
        mark = trail.high_water_mark;
        stop = Some(trail.stop);
        previous = Some(trail.stop);
    }

    // Same for a short, mirrored
    let mut mark = 1.1000;
    let mut stop = None;
    for ask in [1.0990, 1.0995, 1.0970, 1.0985, 1.0950] {
        let trail = calculator.trailing_stop_level(Direction::Sell, ask, mark, 0.001, stop);
        if let Some(prev) = stop {
            assert!(trail.stop <= prev);
        }
        mark = trail.high_water_mark;
        stop = Some(trail.stop);
    }
}
