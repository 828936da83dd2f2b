// Bar validation before anything reaches a strategy

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::DataConfig;
use crate::types::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NonFinite,
    NonPositivePrice,
    HighBelowLow,
    /// Open or close lies outside the bar's [low, high] range
    OutsideRange,
    NegativeVolume,
    /// Older than the last accepted bar
    OutOfOrder,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::NonFinite => "non-finite OHLC value",
            RejectReason::NonPositivePrice => "price at or below zero",
            RejectReason::HighBelowLow => "high below low",
            RejectReason::OutsideRange => "open/close outside the high-low range",
            RejectReason::NegativeVolume => "negative volume",
            RejectReason::OutOfOrder => "timestamp older than the last accepted bar",
        };
        f.write_str(text)
    }
}

/// Raised when consecutive accepted bars are further apart than the period allows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapWarning {
    pub symbol: String,
    pub previous: DateTime<Utc>,
    pub current: DateTime<Utc>,
    pub missing_bars: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BarVerdict {
    Accepted { gap: Option<GapWarning> },
    /// Same timestamp as the last accepted bar; the first one wins
    Duplicate,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedBar {
    pub bar: Bar,
    pub reason: RejectReason,
}

/// Shape checks that need no history
pub fn validate_bar(bar: &Bar, tolerance: f64) -> Result<(), RejectReason> {
    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !p.is_finite()) || !bar.volume.is_finite() {
        return Err(RejectReason::NonFinite);
    }
    if prices.iter().any(|&p| p <= 0.0) {
        return Err(RejectReason::NonPositivePrice);
    }
    if bar.high < bar.low {
        return Err(RejectReason::HighBelowLow);
    }
    let lower = bar.low - tolerance;
    let upper = bar.high + tolerance;
    if [bar.open, bar.close].iter().any(|&p| p < lower || p > upper) {
        return Err(RejectReason::OutsideRange);
    }
    if bar.volume < 0.0 {
        return Err(RejectReason::NegativeVolume);
    }
    Ok(())
}

/// Per-symbol gate keeping the accepted sequence strictly increasing in time
#[derive(Debug, Clone)]
pub struct DataIntegrityGate {
    symbol: String,
    period: Duration,
    gap_threshold: Duration,
    ohlc_tolerance: f64,
    last_accepted: Option<DateTime<Utc>>,
    rejected: VecDeque<RejectedBar>,
    max_rejected: usize,
    gaps_seen: u64,
}

impl DataIntegrityGate {
    pub fn new(symbol: impl Into<String>, period: Duration, config: &DataConfig) -> Self {
        let threshold_ms = period.num_milliseconds() as f64 * (1.0 + config.gap_tolerance);
        Self {
            symbol: symbol.into(),
            period,
            gap_threshold: Duration::milliseconds(threshold_ms.round() as i64),
            ohlc_tolerance: config.ohlc_tolerance,
            last_accepted: None,
            rejected: VecDeque::new(),
            max_rejected: config.rejected_history,
            gaps_seen: 0,
        }
    }

    pub fn check(&mut self, bar: &Bar) -> BarVerdict {
        if let Err(reason) = validate_bar(bar, self.ohlc_tolerance) {
            return self.reject(bar, reason);
        }

        let gap = match self.last_accepted {
            Some(last) if bar.timestamp == last => return BarVerdict::Duplicate,
            Some(last) if bar.timestamp < last => return self.reject(bar, RejectReason::OutOfOrder),
            Some(last) if bar.timestamp - last > self.gap_threshold => {
                let elapsed = bar.timestamp - last;
                let period_ms = self.period.num_milliseconds().max(1);
                let warning = GapWarning {
                    symbol: self.symbol.clone(),
                    previous: last,
                    current: bar.timestamp,
                    missing_bars: (elapsed.num_milliseconds() / period_ms - 1).max(0),
                };
                self.gaps_seen += 1;
                warn!(
                    target: "bridge_trader::data_gate",
                    symbol = %self.symbol,
                    previous = %warning.previous,
                    current = %warning.current,
                    missing_bars = warning.missing_bars,
                    "🕳️  Data gap detected"
                );
                Some(warning)
            }
            _ => None,
        };

        self.last_accepted = Some(bar.timestamp);
        BarVerdict::Accepted { gap }
    }

    fn reject(&mut self, bar: &Bar, reason: RejectReason) -> BarVerdict {
        warn!(
            target: "bridge_trader::data_gate",
            symbol = %self.symbol,
            timestamp = %bar.timestamp,
            reason = %reason,
            "🚫 Bar rejected"
        );
        if self.max_rejected > 0 {
            if self.rejected.len() == self.max_rejected {
                self.rejected.pop_front();
            }
            self.rejected.push_back(RejectedBar { bar: *bar, reason });
        }
        BarVerdict::Rejected(reason)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &RejectedBar> {
        self.rejected.iter()
    }

    pub fn gaps_seen(&self) -> u64 {
        self.gaps_seen
    }

    pub fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.last_accepted
    }
}
