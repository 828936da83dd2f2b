// Risk calculations: position sizing, protective levels, trailing stops and
// partial take-profit triggers. Everything here is deterministic and keeps
// no state between calls.

use tracing::warn;

use crate::config::{LevelSpec, RiskConfig};
use crate::core::instruments::InstrumentRules;
use crate::error::{TradingError, TradingResult};
use crate::types::{Direction, Quote};

const STEP_EPSILON: f64 = 1e-9;

/// A computed SL/TP price and how far it sits from the entry price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelPlacement {
    pub price: f64,
    pub distance: f64,
    /// The desired level was inside the broker's minimum stop distance and
    /// had to be pushed out
    pub widened: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStop {
    /// Most favourable price seen (highest bid for longs, lowest ask for shorts)
    pub high_water_mark: f64,
    pub stop: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartialClose {
    /// Close this volume and keep the rest open
    Volume(f64),
    /// The remainder would be below the minimum lot; close everything
    All,
    /// The stage's share rounds below the minimum lot
    TooSmall,
}

#[derive(Debug, Clone)]
pub struct RiskCalculator {
    config: RiskConfig,
}

impl RiskCalculator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Volume risking `risk_fraction` of equity if the stop at `stop_distance`
    /// is hit. Floored to the lot step and capped at `max_lot`; errors when
    /// the result is below `min_lot`.
    pub fn position_size(
        &self,
        equity: f64,
        risk_fraction: f64,
        stop_distance: f64,
        rules: &InstrumentRules,
    ) -> TradingResult<f64> {
        if !(equity.is_finite() && equity > 0.0) {
            return Err(TradingError::InvalidParameter(
                "equity".to_string(),
                format!("must be positive, got {}", equity),
            ));
        }
        if !(stop_distance.is_finite() && stop_distance > 0.0) {
            return Err(TradingError::InvalidParameter(
                "stop_distance".to_string(),
                format!("must be positive, got {}", stop_distance),
            ));
        }
        if !(risk_fraction > 0.0 && risk_fraction < 1.0) {
            return Err(TradingError::InvalidParameter(
                "risk_fraction".to_string(),
                format!("must be in (0, 1), got {}", risk_fraction),
            ));
        }

        let risk_amount = equity * risk_fraction;
        let raw_volume = (risk_amount / stop_distance) / rules.value_per_unit();
        fit_to_rules(raw_volume, rules)
    }

    /// Configured fixed lot, held to the same step and bounds as a sized one
    pub fn fixed_size(&self, lot: f64, rules: &InstrumentRules) -> TradingResult<f64> {
        if !(lot.is_finite() && lot > 0.0) {
            return Err(TradingError::InvalidParameter(
                "fixed_lot".to_string(),
                format!("must be positive, got {}", lot),
            ));
        }
        fit_to_rules(lot, rules)
    }

    /// Broker minimum stop distance with the configured safety buffer
    pub fn min_stop_distance(&self, rules: &InstrumentRules) -> f64 {
        rules.stop_level * self.config.stop_level_buffer
    }

    /// Stop-loss for a new order, widened to respect the minimum stop distance
    pub fn stop_loss_level(
        &self,
        direction: Direction,
        quote: &Quote,
        rules: &InstrumentRules,
    ) -> TradingResult<LevelPlacement> {
        let entry = direction.entry_price(quote);
        let desired = match self.config.stop_loss {
            LevelSpec::PriceFraction(fraction) => entry * fraction,
            LevelSpec::PriceDistance(distance) => distance,
            LevelSpec::EquityFraction(_) => {
                return Err(TradingError::InvalidParameter(
                    "risk.stop_loss".to_string(),
                    "equity_fraction cannot size the stop".to_string(),
                ))
            }
        };

        let sign = direction.sign();
        let desired_price = entry - sign * desired;
        // The stop triggers on the exit side of the book, so that is where
        // the broker measures the minimum distance from.
        let boundary = direction.exit_price(quote) - sign * self.min_stop_distance(rules);
        let too_tight = match direction {
            Direction::Buy => desired_price > boundary,
            Direction::Sell => desired_price < boundary,
        };

        let price = if too_tight {
            warn!(
                %direction,
                desired = desired_price,
                boundary,
                "🛡️  Stop loss inside broker stop level, widening"
            );
            boundary
        } else {
            desired_price
        };
        let price = round_away_from_market(price, direction, false, rules);

        Ok(LevelPlacement {
            price,
            distance: (entry - price).abs(),
            widened: too_tight,
        })
    }

    /// Take-profit for a new order, or `None` when no take-profit is configured
    pub fn take_profit_level(
        &self,
        direction: Direction,
        quote: &Quote,
        equity: f64,
        volume: f64,
        rules: &InstrumentRules,
    ) -> TradingResult<Option<LevelPlacement>> {
        let Some(spec) = self.config.take_profit else {
            return Ok(None);
        };
        let entry = direction.entry_price(quote);
        let desired = match spec {
            LevelSpec::PriceFraction(fraction) => entry * fraction,
            LevelSpec::PriceDistance(distance) => distance,
            LevelSpec::EquityFraction(fraction) => {
                let exposure = volume * rules.value_per_unit();
                if !(exposure > 0.0) {
                    return Err(TradingError::InvalidParameter(
                        "volume".to_string(),
                        "equity-implied take profit needs a positive volume".to_string(),
                    ));
                }
                equity * fraction / exposure
            }
        };

        let sign = direction.sign();
        let desired_price = entry + sign * desired;
        let boundary = direction.exit_price(quote) + sign * self.min_stop_distance(rules);
        let too_tight = match direction {
            Direction::Buy => desired_price < boundary,
            Direction::Sell => desired_price > boundary,
        };

        let price = if too_tight {
            warn!(
                %direction,
                desired = desired_price,
                boundary,
                "🛡️  Take profit inside broker stop level, widening"
            );
            boundary
        } else {
            desired_price
        };
        let price = round_away_from_market(price, direction, true, rules);

        Ok(Some(LevelPlacement {
            price,
            distance: (price - entry).abs(),
            widened: too_tight,
        }))
    }

    /// Advance the high-water mark with `current_price` and derive the
    /// trailing stop. The returned stop never loosens relative to
    /// `current_stop`.
    pub fn trailing_stop_level(
        &self,
        direction: Direction,
        current_price: f64,
        high_water_mark: f64,
        trail_fraction: f64,
        current_stop: Option<f64>,
    ) -> TrailingStop {
        let mark = match direction {
            Direction::Buy => high_water_mark.max(current_price),
            Direction::Sell => high_water_mark.min(current_price),
        };
        let candidate = mark * (1.0 - direction.sign() * trail_fraction);
        let stop = match (direction, current_stop) {
            (Direction::Buy, Some(existing)) => existing.max(candidate),
            (Direction::Sell, Some(existing)) => existing.min(candidate),
            (_, None) => candidate,
        };
        TrailingStop {
            high_water_mark: mark,
            stop,
        }
    }

    /// Has price moved at least `stage_distance` in the position's favour?
    pub fn partial_take_profit_trigger(
        &self,
        direction: Direction,
        current_price: f64,
        open_price: f64,
        stage_distance: f64,
    ) -> bool {
        direction.sign() * (current_price - open_price) >= stage_distance
    }

    /// Volume a partial stage should close
    pub fn partial_close_volume(
        &self,
        initial_volume: f64,
        close_fraction: f64,
        current_volume: f64,
        rules: &InstrumentRules,
    ) -> PartialClose {
        let volume = floor_to_step(initial_volume * close_fraction, rules.lot_step);
        if volume < rules.min_lot - STEP_EPSILON {
            return PartialClose::TooSmall;
        }
        let remainder = current_volume - volume;
        if remainder < rules.min_lot - STEP_EPSILON {
            PartialClose::All
        } else {
            PartialClose::Volume(volume)
        }
    }
}

/// Favourable move of `price` relative to `open_price` as a fraction of the open
pub fn favourable_move(direction: Direction, price: f64, open_price: f64) -> f64 {
    if open_price == 0.0 {
        return 0.0;
    }
    direction.sign() * (price - open_price) / open_price
}

fn fit_to_rules(raw_volume: f64, rules: &InstrumentRules) -> TradingResult<f64> {
    let mut volume = floor_to_step(raw_volume, rules.lot_step);
    if volume > rules.max_lot {
        volume = floor_to_step(rules.max_lot, rules.lot_step);
    }
    if volume < rules.min_lot - STEP_EPSILON {
        return Err(TradingError::BelowMinimumLot {
            computed: volume,
            min_lot: rules.min_lot,
        });
    }
    Ok(volume)
}

/// Largest multiple of `step` not above `value`, rounded to the step's precision
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if !(step > 0.0) || !value.is_finite() {
        return 0.0;
    }
    let steps = (value / step + STEP_EPSILON).floor().max(0.0);
    let factor = 10f64.powi(step_decimals(step));
    (steps * step * factor).round() / factor
}

fn step_decimals(step: f64) -> i32 {
    let mut decimals = 0;
    while decimals < 10 {
        let scaled = step * 10f64.powi(decimals);
        if (scaled - scaled.round()).abs() < STEP_EPSILON {
            break;
        }
        decimals += 1;
    }
    decimals
}

/// Round a level to the instrument's digits, moving it away from the market
/// so rounding never pulls it back inside the stop distance
fn round_away_from_market(price: f64, direction: Direction, profit_side: bool, rules: &InstrumentRules) -> f64 {
    let factor = 10f64.powi(rules.digits as i32);
    let scaled = price * factor;
    // Long stops and short targets sit below the market
    let below_market = matches!(
        (direction, profit_side),
        (Direction::Buy, false) | (Direction::Sell, true)
    );
    let rounded = if below_market {
        (scaled + 1e-6).floor()
    } else {
        (scaled - 1e-6).ceil()
    };
    rounded / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rules() -> InstrumentRules {
        InstrumentRules {
            min_lot: 0.01,
            max_lot: 50.0,
            lot_step: 0.01,
            stop_level: 0.0003,
            digits: 5,
            tick_value: 1.0,
        }
    }

    fn calculator(stop_loss: LevelSpec) -> RiskCalculator {
        RiskCalculator::new(RiskConfig {
            risk_per_trade: 0.01,
            fixed_lot: None,
            stop_loss,
            take_profit: Some(LevelSpec::PriceDistance(0.0100)),
            stop_level_buffer: 1.5,
            trailing: None,
            partial_take_profit: Vec::new(),
        })
    }

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote { bid, ask, at: Utc::now() }
    }

    fn is_step_multiple(volume: f64, step: f64) -> bool {
        ((volume / step).round() * step - volume).abs() < 1e-9
    }

    #[test]
    fn test_reference_position_size() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let volume = calc
            .position_size(10_000.0, 0.01, 0.0050, &rules())
            .expect("viable trade");
        assert!((volume - 0.20).abs() < 1e-12);
    }

    #[test]
    fn test_position_size_is_step_multiple_within_bounds() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let rules = rules();
        for &(equity, risk, stop) in &[
            (10_000.0, 0.01, 0.0050),
            (2_345.67, 0.015, 0.0013),
            (50_000.0, 0.02, 0.0007),
            (1_000_000.0, 0.05, 0.0001),
            (777.0, 0.005, 0.0031),
        ] {
            match calc.position_size(equity, risk, stop, &rules) {
                Ok(volume) => {
                    assert!(is_step_multiple(volume, rules.lot_step), "{} not a step multiple", volume);
                    assert!(volume >= rules.min_lot && volume <= rules.max_lot);
                }
                Err(e) => assert!(matches!(e, TradingError::BelowMinimumLot { .. })),
            }
        }
    }

    #[test]
    fn test_position_size_caps_at_max_lot() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let volume = calc
            .position_size(1_000_000_000.0, 0.05, 0.0001, &rules())
            .expect("capped trade");
        assert_eq!(volume, 50.0);
    }

    #[test]
    fn test_position_size_below_minimum() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let result = calc.position_size(100.0, 0.001, 0.0500, &rules());
        assert!(matches!(result, Err(TradingError::BelowMinimumLot { .. })));
    }

    #[test]
    fn test_fixed_size_is_fitted_to_rules() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let rules = rules();
        assert_eq!(calc.fixed_size(0.137, &rules).unwrap(), 0.13);
        assert_eq!(calc.fixed_size(80.0, &rules).unwrap(), 50.0);
        assert!(matches!(
            calc.fixed_size(0.004, &rules),
            Err(TradingError::BelowMinimumLot { .. })
        ));
        assert!(calc.fixed_size(0.0, &rules).is_err());
    }

    #[test]
    fn test_stop_loss_respects_min_distance() {
        // 2 pips desired, broker needs 3 × 1.5 = 4.5 pips from the bid
        let calc = calculator(LevelSpec::PriceDistance(0.0002));
        let placement = calc
            .stop_loss_level(Direction::Buy, &quote(1.10000, 1.10010), &rules())
            .expect("stop level");
        assert!(placement.widened);
        assert!(placement.price <= 1.10000 - 0.00045 + 1e-12);

        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let placement = calc
            .stop_loss_level(Direction::Sell, &quote(1.10000, 1.10010), &rules())
            .expect("stop level");
        assert!(!placement.widened);
        assert!((placement.price - 1.10500).abs() < 1e-9);
    }

    #[test]
    fn test_take_profit_equity_fraction() {
        let mut config = calculator(LevelSpec::PriceDistance(0.0050)).config().clone();
        config.take_profit = Some(LevelSpec::EquityFraction(0.02));
        let calc = RiskCalculator::new(config);
        // 2% of 10k = 200; 0.2 lots × 100000 = 20000 per unit → 0.01 distance
        let placement = calc
            .take_profit_level(Direction::Buy, &quote(1.10000, 1.10000), 10_000.0, 0.20, &rules())
            .expect("tp")
            .expect("configured");
        assert!((placement.price - 1.11000).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_stop_is_monotonic() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        let prices = [1.1000, 1.1010, 1.1005, 1.1030, 1.0990, 1.1040, 1.1040];
        let mut mark = 1.1000;
        let mut stop: Option<f64> = None;
        for price in prices {
            let next = calc.trailing_stop_level(Direction::Buy, price, mark, 0.001, stop);
            if let Some(previous) = stop {
                assert!(next.stop >= previous);
            }
            mark = next.high_water_mark;
            stop = Some(next.stop);
        }
        assert_eq!(mark, 1.1040);

        let mut mark = 1.1000;
        let mut stop: Option<f64> = None;
        for price in [1.0990, 1.1020, 1.0950, 1.0960] {
            let next = calc.trailing_stop_level(Direction::Sell, price, mark, 0.001, stop);
            if let Some(previous) = stop {
                assert!(next.stop <= previous);
            }
            mark = next.high_water_mark;
            stop = Some(next.stop);
        }
        assert_eq!(mark, 1.0950);
    }

    #[test]
    fn test_partial_trigger_is_pure_distance() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        assert!(calc.partial_take_profit_trigger(Direction::Buy, 1.1011, 1.1000, 0.0010));
        assert!(!calc.partial_take_profit_trigger(Direction::Buy, 1.1009, 1.1000, 0.0010));
        assert!(calc.partial_take_profit_trigger(Direction::Sell, 1.0989, 1.1000, 0.0010));
        assert!(!calc.partial_take_profit_trigger(Direction::Sell, 1.1011, 1.1000, 0.0010));
    }

    #[test]
    fn test_partial_close_volume() {
        let calc = calculator(LevelSpec::PriceDistance(0.0050));
        assert_eq!(calc.partial_close_volume(0.20, 0.5, 0.20, &rules()), PartialClose::Volume(0.10));
        assert_eq!(calc.partial_close_volume(0.02, 0.25, 0.02, &rules()), PartialClose::TooSmall);
        assert_eq!(calc.partial_close_volume(0.20, 0.5, 0.105, &rules()), PartialClose::All);
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(0.2999999, 0.01), 0.29);
        assert_eq!(floor_to_step(0.30000000001, 0.01), 0.3);
        assert_eq!(floor_to_step(7.0, 0.5), 7.0);
        assert_eq!(floor_to_step(-1.0, 0.01), 0.0);
    }
}
