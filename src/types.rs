// Common types used across the application

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1.0 for longs, -1.0 for shorts
    pub fn sign(self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// Price a new order in this direction fills at
    pub fn entry_price(self, quote: &Quote) -> f64 {
        match self {
            Direction::Buy => quote.ask,
            Direction::Sell => quote.bid,
        }
    }

    /// Price an open position in this direction would close at
    pub fn exit_price(self, quote: &Quote) -> f64 {
        match self {
            Direction::Buy => quote.bid,
            Direction::Sell => quote.ask,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Parse a signal coming from a loosely typed source. Anything that is
    /// not BUY or SELL is treated as HOLD.
    pub fn parse_lenient(raw: &str) -> Signal {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Signal::Buy,
            "SELL" => Signal::Sell,
            _ => Signal::Hold,
        }
    }

    pub fn direction(self) -> Option<Direction> {
        match self {
            Signal::Buy => Some(Direction::Buy),
            Signal::Sell => Some(Direction::Sell),
            Signal::Hold => None,
        }
    }
}

/// One OHLCV bar for a symbol/timeframe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest top-of-book for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub currency: String,
    pub leverage: u32,
}

/// Bar period in the broker's notation (M1, M5, H1, D1, W1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Weeks(u32),
}

impl Timeframe {
    pub fn as_duration(&self) -> Duration {
        match *self {
            Timeframe::Minutes(n) => Duration::minutes(n as i64),
            Timeframe::Hours(n) => Duration::hours(n as i64),
            Timeframe::Days(n) => Duration::days(n as i64),
            Timeframe::Weeks(n) => Duration::weeks(n as i64),
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_uppercase();
        let mut chars = s.chars();
        let unit = chars.next();
        let count: u32 = chars
            .as_str()
            .parse()
            .map_err(|_| format!("invalid timeframe '{}'", s))?;
        if count == 0 {
            return Err(format!("timeframe '{}' has a zero period", s));
        }
        match unit {
            Some('M') => Ok(Timeframe::Minutes(count)),
            Some('H') => Ok(Timeframe::Hours(count)),
            Some('D') => Ok(Timeframe::Days(count)),
            Some('W') => Ok(Timeframe::Weeks(count)),
            _ => Err(format!("unknown timeframe unit in '{}'", s)),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Minutes(n) => write!(f, "M{}", n),
            Timeframe::Hours(n) => write!(f, "H{}", n),
            Timeframe::Days(n) => write!(f, "D{}", n),
            Timeframe::Weeks(n) => write!(f, "W{}", n),
        }
    }
}

/// Source of wall-clock time, injectable so time-dependent logic is testable
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!("M5".parse::<Timeframe>(), Ok(Timeframe::Minutes(5)));
        assert_eq!("h1".parse::<Timeframe>(), Ok(Timeframe::Hours(1)));
        assert_eq!(
            "D1".parse::<Timeframe>().map(|t| t.as_duration()),
            Ok(Duration::days(1))
        );
        assert!("X5".parse::<Timeframe>().is_err());
        assert!("M0".parse::<Timeframe>().is_err());
        assert!("".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_signal_parse_lenient() {
        assert_eq!(Signal::parse_lenient("buy"), Signal::Buy);
        assert_eq!(Signal::parse_lenient(" SELL "), Signal::Sell);
        assert_eq!(Signal::parse_lenient("CLOSE"), Signal::Hold);
        assert_eq!(Signal::parse_lenient(""), Signal::Hold);
    }

    #[test]
    fn test_direction_prices() {
        let quote = Quote {
            bid: 1.1000,
            ask: 1.1002,
            at: Utc::now(),
        };
        assert_eq!(Direction::Buy.entry_price(&quote), 1.1002);
        assert_eq!(Direction::Buy.exit_price(&quote), 1.1000);
        assert_eq!(Direction::Sell.entry_price(&quote), 1.1000);
        assert_eq!(Direction::Sell.opposite(), Direction::Buy);
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
