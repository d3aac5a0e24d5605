//! Per-host circuit breaker, lock-free via atomics.
//!
//! Unlike a generic `execute(operation)` wrapper, the fetcher needs to check
//! the breaker, separately acquire a rate-limit token, make the HTTP call,
//! and then decide for itself whether the outcome counts as a failure (a 429
//! never does). So the breaker here exposes `try_acquire` / `record_success` /
//! `record_failure` instead of wrapping a closure — same admission and
//! transition logic, shaped so the caller can interleave other policies
//! between the check and the outcome.

use crate::clock::{Clock, MonotonicClock, SharedClock};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_calls: usize::MAX,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(30), half_open_max_calls: 1 }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    half_open_successes: AtomicUsize,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            half_open_successes: AtomicUsize::new(0),
        }
    }
}

/// Rejection reason returned when a call cannot be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open ({failure_count} failures, open for {open_duration_millis}ms)")]
pub struct CircuitOpen {
    pub failure_count: usize,
    pub open_duration_millis: u64,
}

/// Proof that a call was admitted; must be resolved via `record_success` or
/// `record_failure` exactly once. Dropping it without resolving leaves
/// half-open accounting unbalanced, so the fetcher always resolves it in a
/// `match` on the HTTP outcome rather than letting it fall out of scope.
#[must_use]
pub struct CircuitPermit {
    was_half_open: bool,
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("state", &self.current_state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls: 1,
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self { state: Arc::new(CircuitBreakerState::new()), config, clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_half_open_limit(mut self, limit: usize) -> Self {
        self.config.half_open_max_calls = limit;
        self
    }

    pub fn current_state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state byte"),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Ask permission to make a call. On success, the caller must resolve the
    /// returned permit via `record_success`/`record_failure`.
    pub fn try_acquire(&self) -> Result<CircuitPermit, CircuitOpen> {
        loop {
            let current = self.state.state.load(Ordering::Acquire);
            match current {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.state.half_open_successes.store(0, Ordering::Release);
                                return Ok(CircuitPermit { was_half_open: true });
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => return Ok(CircuitPermit { was_half_open: false }),
                            Err(_) => unreachable!("invalid circuit breaker transition"),
                        }
                    } else {
                        return Err(CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration_millis: elapsed,
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration_millis: 0,
                        });
                    }
                    tracing::debug!(
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "circuit breaker: half-open probe admitted"
                    );
                    return Ok(CircuitPermit { was_half_open: true });
                }
                STATE_CLOSED => return Ok(CircuitPermit { was_half_open: false }),
                _ => unreachable!("invalid circuit breaker state byte"),
            }
        }
    }

    pub fn record_success(&self, permit: CircuitPermit) {
        if permit.was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }
        self.on_success();
    }

    pub fn record_failure(&self, permit: CircuitPermit) {
        if permit.was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }
        self.on_failure();
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                let successes = self.state.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes < self.config.half_open_max_calls {
                    tracing::debug!(
                        successes,
                        needed = self.config.half_open_max_calls,
                        "circuit breaker: half-open probe succeeded, awaiting more"
                    );
                    return;
                }
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    self.state.half_open_successes.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.half_open_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: half-open probe failed -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(failures, threshold = self.config.failure_threshold, "circuit breaker -> open");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn starts_closed_and_admits_calls() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        let permit = breaker.try_acquire().unwrap();
        breaker.record_success(permit);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn non_429_success_resets_failure_count() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));
        for _ in 0..2 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        let permit = breaker.try_acquire().unwrap();
        breaker.record_success(permit);
        assert_eq!(breaker.failure_count(), 0);

        for _ in 0..2 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout_with_manual_clock() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_millis(100)).with_clock(Arc::new(clock.clone()));

        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit);
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());

        clock.advance(150);
        let permit = breaker.try_acquire().unwrap();
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        breaker.record_success(permit);
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_probe_failure() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_millis(100)).with_clock(Arc::new(clock.clone()));
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit);
        clock.advance(150);
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit);
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_millis(100))
            .with_clock(Arc::new(clock.clone()))
            .with_half_open_limit(1);
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit);
        clock.advance(150);

        let first = breaker.try_acquire();
        assert!(first.is_ok());
        let second = breaker.try_acquire();
        assert!(second.is_err());
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig::disabled());
        for _ in 0..1000 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
