//! Per-agent circuit breaker state machine (§3/§4.6, invariant I4).

use serde::{Deserialize, Serialize};

use super::ids::Timestamp;

/// Circuit breaker mode. Transitions form the cycle
/// `Closed → Open → HalfOpen → {Closed, Open}`; there is no direct
/// `Closed → HalfOpen` jump (I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerMode {
    /// Normal operation; failures are being counted.
    Closed,
    /// Tripped; recovery attempts against this agent are skipped.
    Open,
    /// Probationary; the next attempt determines whether to close or reopen.
    HalfOpen,
}

/// Per-agent failure counter and breaker mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Consecutive failures observed since the breaker last closed.
    pub failures: u32,
    /// Time of the most recent failure, if any.
    pub last_failure_time: Option<Timestamp>,
    /// Current mode.
    pub mode: CircuitBreakerMode,
    /// Earliest time a `HalfOpen` probe may be attempted, set when the
    /// breaker opens.
    pub next_attempt_at: Option<Timestamp>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            failures: 0,
            last_failure_time: None,
            mode: CircuitBreakerMode::Closed,
            next_attempt_at: None,
        }
    }
}

impl CircuitBreakerState {
    /// Records a failure. Opens the breaker once `failures` reaches
    /// `threshold`; a failure observed while `HalfOpen` reopens immediately
    /// with a fresh timeout.
    pub fn record_failure(&mut self, threshold: u32, timeout_ms: u64) {
        let now = Timestamp::now();
        self.last_failure_time = Some(now);

        match self.mode {
            CircuitBreakerMode::HalfOpen => {
                self.open(now, timeout_ms);
            }
            CircuitBreakerMode::Closed => {
                self.failures += 1;
                if self.failures >= threshold {
                    self.open(now, timeout_ms);
                }
            }
            CircuitBreakerMode::Open => {
                self.failures += 1;
            }
        }
    }

    fn open(&mut self, now: Timestamp, timeout_ms: u64) {
        self.mode = CircuitBreakerMode::Open;
        self.next_attempt_at = Some(Timestamp::new(
            now.into_inner().saturating_add(i64::try_from(timeout_ms).unwrap_or(i64::MAX)),
        ));
    }

    /// Records a success. A success while `HalfOpen` closes the breaker and
    /// resets the failure count; a success while `Closed` just resets the
    /// count.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.mode = CircuitBreakerMode::Closed;
        self.next_attempt_at = None;
    }

    /// Moves an `Open` breaker whose timeout has elapsed into `HalfOpen`.
    /// Called by the periodic sweep (`checkCircuitBreakers`, every 10s).
    pub fn tick(&mut self, now: Timestamp) {
        if self.mode == CircuitBreakerMode::Open
            && let Some(next_attempt_at) = self.next_attempt_at
            && now >= next_attempt_at
        {
            self.mode = CircuitBreakerMode::HalfOpen;
        }
    }

    /// Whether a recovery attempt against this agent should be skipped.
    #[must_use]
    pub fn blocks_recovery(&self) -> bool {
        self.mode == CircuitBreakerMode::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreakerState::default();
        for _ in 0..4 {
            breaker.record_failure(5, 60_000);
            assert_eq!(breaker.mode, CircuitBreakerMode::Closed);
        }
        breaker.record_failure(5, 60_000);
        assert_eq!(breaker.mode, CircuitBreakerMode::Open);
        assert!(breaker.blocks_recovery());
    }

    #[test]
    fn half_opens_only_after_timeout_elapses() {
        let mut breaker = CircuitBreakerState::default();
        for _ in 0..5 {
            breaker.record_failure(5, 60_000);
        }
        let opened_at = breaker.next_attempt_at.unwrap();
        breaker.tick(Timestamp::new(opened_at.into_inner() - 1));
        assert_eq!(breaker.mode, CircuitBreakerMode::Open);
        breaker.tick(opened_at);
        assert_eq!(breaker.mode, CircuitBreakerMode::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timeout() {
        let mut breaker = CircuitBreakerState::default();
        for _ in 0..5 {
            breaker.record_failure(5, 60_000);
        }
        breaker.mode = CircuitBreakerMode::HalfOpen;
        breaker.record_failure(5, 60_000);
        assert_eq!(breaker.mode, CircuitBreakerMode::Open);
    }

    #[test]
    fn half_open_success_closes_breaker() {
        let mut breaker = CircuitBreakerState::default();
        for _ in 0..5 {
            breaker.record_failure(5, 60_000);
        }
        breaker.mode = CircuitBreakerMode::HalfOpen;
        breaker.record_success();
        assert_eq!(breaker.mode, CircuitBreakerMode::Closed);
        assert_eq!(breaker.failures, 0);
    }

    #[test]
    fn never_jumps_closed_to_half_open() {
        let mut breaker = CircuitBreakerState::default();
        breaker.tick(Timestamp::now());
        assert_eq!(breaker.mode, CircuitBreakerMode::Closed);
    }
}
