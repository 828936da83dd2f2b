// Bounded retries for recoverable failures and the halt gate for new orders

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::PersistenceConfig;
use crate::error::{TradingError, TradingResult};

/// Retry mechanism with exponential backoff.
///
/// Runs on the caller's thread: persistence is on the critical path of
/// event processing and must finish before the next event is applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        let base = Duration::from_millis(config.retry_delay_ms);
        Self::new(config.max_attempts, base, base * 8, 2.0)
    }

    /// A single attempt with no waiting, for tests and replays
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are used up. The last error is returned.
    pub fn execute<T, F>(&self, what: &str, mut operation: F) -> TradingResult<T>
    where
        F: FnMut(u32) -> TradingResult<T>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!("✅ {} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "⚠️  {} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, error
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    delay = std::cmp::min(delay.mul_f64(self.backoff_multiplier), self.max_delay);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,                           // 3 attempts
            Duration::from_millis(50),   // 50ms base delay
            Duration::from_millis(400),  // 400ms max delay
            2.0,                         // Double delay each time
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HaltReason {
    /// Position state could not be made durable
    PersistenceFailure,
    /// The counterpart stopped answering heartbeats
    CounterpartDead,
    /// Persisted state could not be read at startup
    StateUnreadable,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::PersistenceFailure => write!(f, "persistence failure"),
            HaltReason::CounterpartDead => write!(f, "counterpart dead"),
            HaltReason::StateUnreadable => write!(f, "persisted state unreadable"),
        }
    }
}

/// Gate in front of new order dispatch. Closes and modifications always
/// pass; opens are refused while any reason is active.
#[derive(Debug, Clone, Default)]
pub struct HaltGate {
    reasons: BTreeSet<HaltReason>,
}

impl HaltGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&mut self, reason: HaltReason) {
        if self.reasons.insert(reason) {
            warn!("🛑 New orders halted: {}", reason);
        }
    }

    pub fn clear(&mut self, reason: HaltReason) {
        if self.reasons.remove(&reason) {
            if self.reasons.is_empty() {
                info!("✅ Halt cleared ({}); new orders allowed", reason);
            } else {
                info!("Halt reason cleared: {} (still halted: {:?})", reason, self.reasons);
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        !self.reasons.is_empty()
    }

    pub fn is_halted_for(&self, reason: HaltReason) -> bool {
        self.reasons.contains(&reason)
    }

    pub fn reasons(&self) -> impl Iterator<Item = HaltReason> + '_ {
        self.reasons.iter().copied()
    }

    /// Error describing why opens are refused, if they are
    pub fn check_opens(&self) -> TradingResult<()> {
        if self.reasons.contains(&HaltReason::CounterpartDead) {
            return Err(TradingError::CounterpartDead(
                "new orders are refused until a fresh heartbeat arrives".to_string(),
            ));
        }
        match self.reasons.iter().next() {
            Some(reason) => Err(TradingError::OpensHalted(reason.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, 2.0);
        let calls = Cell::new(0);
        let result: TradingResult<()> = policy.execute("save", |_| {
            calls.set(calls.get() + 1);
            Err(TradingError::PersistenceIo("disk full".to_string()))
        });
        assert!(matches!(result, Err(TradingError::PersistenceIo(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_does_not_repeat_permanent_errors() {
        let policy = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO, 2.0);
        let calls = Cell::new(0);
        let result: TradingResult<()> = policy.execute("load", |_| {
            calls.set(calls.get() + 1);
            Err(TradingError::StateCorrupt("truncated".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_recovers() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2), 2.0);
        let result = policy.execute("save", |attempt| {
            if attempt < 2 {
                Err(TradingError::PersistenceTimeout(10))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.ok(), Some(2));
    }

    #[test]
    fn test_halt_gate() {
        let mut gate = HaltGate::new();
        assert!(gate.check_opens().is_ok());

        gate.halt(HaltReason::PersistenceFailure);
        gate.halt(HaltReason::CounterpartDead);
        assert!(matches!(gate.check_opens(), Err(TradingError::CounterpartDead(_))));

        gate.clear(HaltReason::CounterpartDead);
        assert!(matches!(gate.check_opens(), Err(TradingError::OpensHalted(_))));

        gate.clear(HaltReason::PersistenceFailure);
        assert!(!gate.is_halted());
    }
}
