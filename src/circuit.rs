//! The circuit breaker (§3, §4.3): a mutable, lock-protected fault state
//! machine shared by every call the client makes.
//!
//! All transitions and reads happen under a single `parking_lot::Mutex` so
//! that `can_admit` is atomic with the state read and half-open counter
//! increment — the design's explicit TOCTOU requirement. This mirrors the
//! teacher's own `Circuit` type (`tower-resilience-circuitbreaker::circuit`)
//! in spirit, simplified to the CLOSED/OPEN/HALF_OPEN contract this design
//! needs (no sliding windows, no slow-call detection).

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::BridgeError;

/// Circuit breaker state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Monitoring snapshot returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    /// Wall-clock time the breaker is expected to move OPEN → HALF_OPEN.
    pub recovery_at: Option<Instant>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    half_open_successes: u32,
    half_open_inflight: u32,
    last_failure_at: Option<Instant>,
}

/// Fault state machine gating admission of calls to the transport.
///
/// Resolved open question (§4.3, §9 of the design): HALF_OPEN transitions
/// back to CLOSED only after `half_open_max` *successes*, not on the first
/// one — a single lucky probe is not enough evidence of recovery for a
/// trading connection.
pub struct CircuitBreaker {
    threshold: u32,
    recovery: Duration,
    half_open_max: u32,
    enabled: bool,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given failure threshold, recovery window,
    /// and half-open probe budget (§3 Config fields `cb_threshold`,
    /// `cb_recovery_seconds`, `cb_half_open_max`).
    pub fn new(threshold: u32, recovery: Duration, half_open_max: u32) -> Self {
        Self::with_enabled(threshold, recovery, half_open_max, true)
    }

    /// Creates a breaker honoring Config's `enable_circuit_breaker` flag: when
    /// `false`, `gate()` always admits and `record_success`/`record_failure`
    /// are no-ops, but `status()` still reports the (frozen, CLOSED) state so
    /// monitoring keeps working with the breaker turned off.
    pub fn with_enabled(threshold: u32, recovery: Duration, half_open_max: u32, enabled: bool) -> Self {
        Self {
            threshold,
            recovery,
            half_open_max,
            enabled,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_successes: 0,
                half_open_inflight: 0,
                last_failure_at: None,
            }),
        }
    }

    /// `can_admit()` (§4.3): true in CLOSED; performs the OPEN→HALF_OPEN time
    /// check first; in HALF_OPEN admits up to `half_open_max` concurrent
    /// probes, incrementing the in-flight counter atomically with the check.
    pub fn can_admit(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_inflight < self.half_open_max {
                    inner.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Gate a call: returns `Err(BridgeError::CircuitOpen)` if admission is
    /// refused, otherwise `Ok(())`.
    pub fn gate(&self) -> Result<(), BridgeError> {
        if !self.enabled {
            return Ok(());
        }
        if self.can_admit() {
            Ok(())
        } else {
            let recovers_at = {
                let inner = self.inner.lock();
                inner
                    .last_failure_at
                    .map(|t| t + self.recovery)
                    .unwrap_or_else(Instant::now)
            };
            Err(BridgeError::CircuitOpen {
                recovers_at: crate::error::recovers_at(
                    recovers_at.saturating_duration_since(Instant::now()),
                ),
            })
        }
    }

    /// `record_success()` (§4.3): resets failures in CLOSED; counts a
    /// half-open probe success, closing the breaker once `half_open_max`
    /// successes have been observed.
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count += 1;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                inner.half_open_successes += 1;
                if inner.half_open_inflight > 0 {
                    inner.half_open_inflight -= 1;
                }
                if inner.half_open_successes >= self.half_open_max {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_inflight = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// `record_failure()` (§4.3): increments in CLOSED, opening at threshold;
    /// any failure in HALF_OPEN immediately reopens the breaker.
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_at = Some(Instant::now());
                if inner.failure_count >= self.threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failure_count = inner.failure_count,
                        recovery_seconds = self.recovery.as_secs_f64(),
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure_at = Some(Instant::now());
                inner.half_open_successes = 0;
                inner.half_open_inflight = 0;
                warn!(
                    recovery_seconds = self.recovery.as_secs_f64(),
                    "circuit breaker reopened after a failed half-open probe"
                );
            }
            CircuitState::Open => {
                inner.last_failure_at = Some(Instant::now());
            }
        }
    }

    /// Current state, performing the self-healing OPEN→HALF_OPEN check.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        inner.state
    }

    /// `status()` (§4.3): monitoring snapshot including `recovery_at` when OPEN.
    pub fn status(&self) -> CircuitStatus {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        CircuitStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            recovery_at: match inner.state {
                CircuitState::Open => inner.last_failure_at.map(|t| t + self.recovery),
                _ => None,
            },
        }
    }

    /// `reset()` (§4.3): admin-only, returns to CLOSED and clears counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_successes = 0;
        inner.half_open_inflight = 0;
        inner.last_failure_at = None;
    }

    fn maybe_recover(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure_at {
                if last_failure.elapsed() >= self.recovery {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_inflight = 0;
                    inner.half_open_successes = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn closed_opens_at_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(30), 2);
        for _ in 0..2 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_in_closed_resets_failure_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(30), 2);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_recovery() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20), 2);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_admit());
        sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_requires_threshold_successes_to_close() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10), 3);
        cb.record_failure();
        sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn any_failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10), 3);
        cb.record_failure();
        sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_admits_at_most_half_open_max_concurrent_probes() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10), 2);
        cb.record_failure();
        sleep(Duration::from_millis(15));
        assert!(cb.can_admit());
        assert!(cb.can_admit());
        assert!(!cb.can_admit());
    }

    #[test]
    fn disabled_breaker_always_admits_and_ignores_failures() {
        let cb = CircuitBreaker::with_enabled(1, Duration::from_secs(30), 2, false);
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.gate().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn reset_clears_all_state() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(30), 2);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failure_count, 0);
    }
}
