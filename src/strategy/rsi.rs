// RSI mean reversion: signals when price leaves an extreme zone

use tracing::debug;

use super::{number_param, period_param, Strategy};
use crate::error::{TradingError, TradingResult};
use crate::types::{Bar, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Oversold,
    Neutral,
    Overbought,
}

#[derive(Debug, Clone)]
pub struct RsiStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
    last_zone: Zone,
}

impl RsiStrategy {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> TradingResult<Self> {
        if period < 2 || !(0.0 < oversold && oversold < overbought && overbought < 100.0) {
            return Err(TradingError::StrategyParams {
                strategy: "rsi".to_string(),
                reason: format!(
                    "need period >= 2 and 0 < oversold < overbought < 100, got {} / {} / {}",
                    period, oversold, overbought
                ),
            });
        }
        Ok(Self {
            period,
            oversold,
            overbought,
            last_zone: Zone::Neutral,
        })
    }

    pub fn from_params(params: &toml::Table) -> TradingResult<Self> {
        Self::new(
            period_param("rsi", params, "rsi_period", 14)?,
            number_param("rsi", params, "oversold_threshold", 30.0)?,
            number_param("rsi", params, "overbought_threshold", 70.0)?,
        )
    }

    fn zone(&self, rsi: f64) -> Zone {
        if rsi < self.oversold {
            Zone::Oversold
        } else if rsi > self.overbought {
            Zone::Overbought
        } else {
            Zone::Neutral
        }
    }
}

/// Wilder-smoothed RSI of the closes; `None` until `period + 1` bars exist
pub fn wilder_rsi(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = bars.windows(2).map(|w| w[1].close - w[0].close).collect();
    let (seed, rest) = changes.split_at(period);

    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

    let n = period as f64;
    for change in rest {
        avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn reset(&mut self) {
        self.last_zone = Zone::Neutral;
    }

    fn get_signal(&mut self, bars: &[Bar]) -> Signal {
        let Some(rsi) = wilder_rsi(bars, self.period) else {
            return Signal::Hold;
        };
        let zone = self.zone(rsi);
        debug!(rsi, ?zone, last_zone = ?self.last_zone, "rsi values");

        let signal = match (self.last_zone, zone) {
            (Zone::Oversold, Zone::Neutral) => Signal::Buy,
            (Zone::Overbought, Zone::Neutral) => Signal::Sell,
            _ => Signal::Hold,
        };
        self.last_zone = zone;
        signal
    }
}
