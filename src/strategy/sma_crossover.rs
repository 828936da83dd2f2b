// Moving-average crossover, edge triggered

use tracing::debug;

use super::{period_param, Strategy};
use crate::error::{TradingError, TradingResult};
use crate::types::{Bar, Signal};

const EPSILON: f64 = 1e-9;

/// Signals once when the short SMA crosses the long SMA, then holds until
/// the next cross.
#[derive(Debug, Clone)]
pub struct SmaCrossover {
    short_period: usize,
    long_period: usize,
    last_side: Signal,
}

impl SmaCrossover {
    pub fn new(short_period: usize, long_period: usize) -> TradingResult<Self> {
        if short_period == 0 || short_period >= long_period {
            return Err(TradingError::StrategyParams {
                strategy: "sma_crossover".to_string(),
                reason: format!(
                    "need 0 < short_period < long_period, got {}/{}",
                    short_period, long_period
                ),
            });
        }
        Ok(Self {
            short_period,
            long_period,
            last_side: Signal::Hold,
        })
    }

    pub fn from_params(params: &toml::Table) -> TradingResult<Self> {
        let short = period_param("sma_crossover", params, "short_period", 10)?;
        let long = period_param("sma_crossover", params, "long_period", 20)?;
        Self::new(short, long)
    }
}

fn sma(bars: &[Bar], period: usize) -> f64 {
    let start = bars.len() - period;
    bars[start..].iter().map(|b| b.close).sum::<f64>() / period as f64
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &'static str {
        "sma_crossover"
    }

    fn reset(&mut self) {
        self.last_side = Signal::Hold;
    }

    fn get_signal(&mut self, bars: &[Bar]) -> Signal {
        if bars.len() < self.long_period {
            return Signal::Hold;
        }

        let short = sma(bars, self.short_period);
        let long = sma(bars, self.long_period);
        debug!(short, long, previous = ?self.last_side, "sma values");

        let side = if short - long > EPSILON {
            Signal::Buy
        } else if long - short > EPSILON {
            Signal::Sell
        } else {
            Signal::Hold
        };

        let signal = match side {
            Signal::Buy | Signal::Sell if side != self.last_side => side,
            _ => Signal::Hold,
        };
        self.last_side = side;
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: DateTime::from_timestamp(1_700_000_000 + i as i64 * 60, 0).unwrap_or_default(),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_signals_only_on_cross() {
        let mut strategy = SmaCrossover::new(2, 4).unwrap();
        let series = bars(&[1.0, 1.0, 1.0, 1.0, 1.2, 1.3, 1.4, 0.8, 0.7]);

        let signals: Vec<Signal> = (1..=series.len())
            .map(|n| strategy.get_signal(&series[..n]))
            .collect();
        assert_eq!(
            signals,
            vec![
                Signal::Hold, Signal::Hold, Signal::Hold, Signal::Hold,
                Signal::Buy, Signal::Hold, Signal::Hold, Signal::Sell, Signal::Hold,
            ]
        );
    }

    #[test]
    fn test_reset_rearms() {
        let mut strategy = SmaCrossover::new(2, 4).unwrap();
        let series = bars(&[1.0, 1.0, 1.2, 1.4]);
        assert_eq!(strategy.get_signal(&series), Signal::Buy);
        assert_eq!(strategy.get_signal(&series), Signal::Hold);
        strategy.reset();
        assert_eq!(strategy.get_signal(&series), Signal::Buy);
    }

    #[test]
    fn test_rejects_inverted_periods() {
        assert!(SmaCrossover::new(20, 10).is_err());
    }
}
