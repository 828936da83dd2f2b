// Bar-counting strategy for exercising the order path without market logic

use tracing::info;

use super::Strategy;
use crate::types::{Bar, Signal};

/// BUY on every 5th bar, SELL on every 10th
#[derive(Debug, Clone, Default)]
pub struct TickCounter {
    bars_seen: u64,
}

impl TickCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for TickCounter {
    fn name(&self) -> &'static str {
        "tick_counter"
    }

    fn reset(&mut self) {
        self.bars_seen = 0;
    }

    fn get_signal(&mut self, _bars: &[Bar]) -> Signal {
        self.bars_seen += 1;
        if self.bars_seen % 10 == 0 {
            info!("🔢 Tick counter at {}: SELL", self.bars_seen);
            Signal::Sell
        } else if self.bars_seen % 5 == 0 {
            info!("🔢 Tick counter at {}: BUY", self.bars_seen);
            Signal::Buy
        } else {
            Signal::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence() {
        let mut strategy = TickCounter::new();
        let signals: Vec<Signal> = (0..10).map(|_| strategy.get_signal(&[])).collect();
        assert_eq!(signals[4], Signal::Buy);
        assert_eq!(signals[9], Signal::Sell);
        assert_eq!(signals.iter().filter(|s| **s == Signal::Hold).count(), 8);
    }
}
