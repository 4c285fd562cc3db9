//! Single-endpoint circuit breaker state machine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreakerConfig, StateListener};

/// Breaker state for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow; outcomes feed the sliding window.
    Closed,
    /// Calls are rejected until the wait duration elapses.
    Open,
    /// A limited number of probe calls decide whether to close again.
    HalfOpen,
    /// Calls always flow and nothing is recorded.
    Disabled,
    /// Calls are always rejected.
    ForcedOpen,
    /// Calls always flow; outcomes are recorded but never trip the breaker.
    MetricsOnly,
}

impl CircuitState {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Disabled => "disabled",
            CircuitState::ForcedOpen => "forced_open",
            CircuitState::MetricsOnly => "metrics_only",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one call as judged by the caller's failure predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call counts as healthy.
    Success,
    /// The call counts against the endpoint.
    Failure,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `true` entries are failures.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    /// Bumped on every transition so permits issued in an earlier state are
    /// not counted against the new one.
    generation: u64,
}

impl BreakerInner {
    fn failure_rate(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f32 * 100.0 / self.window.len() as f32
    }
}

/// Circuit breaker guarding one endpoint.
pub struct CircuitBreaker {
    key: String,
    config: Arc<CircuitBreakerConfig>,
    inner: Mutex<BreakerInner>,
    last_used: AtomicU64,
    listener: Option<StateListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(
        key: impl Into<String>,
        config: Arc<CircuitBreakerConfig>,
        listener: Option<StateListener>,
    ) -> Self {
        Self {
            key: key.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.sliding_window_size),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                generation: 0,
            }),
            config,
            last_used: AtomicU64::new(0),
            listener,
        }
    }

    /// Endpoint key this breaker guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failure rate in percent over the current window.
    pub fn failure_rate(&self) -> f32 {
        self.lock().failure_rate()
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask whether a call may proceed at `now`.
    ///
    /// Returns the generation to stamp on the permit, or `None` when the call
    /// must be rejected.
    pub(crate) fn try_acquire_at(&self, now: Instant) -> Option<u64> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::Disabled | CircuitState::MetricsOnly => {
                Some(inner.generation)
            }
            CircuitState::ForcedOpen => None,
            CircuitState::Open => {
                let waited = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or_default();
                if waited < self.config.wait_duration_in_open_state {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen, now);
                inner.half_open_in_flight = 1;
                Some(inner.generation)
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.permitted_half_open_calls.max(1) {
                    return None;
                }
                inner.half_open_in_flight += 1;
                Some(inner.generation)
            }
        }
    }

    /// Record the outcome of a call permitted under `generation`.
    pub(crate) fn record_at(&self, generation: u64, outcome: Outcome, now: Instant) {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(endpoint = %self.key, "ignoring outcome from a previous breaker state");
            return;
        }
        let failed = outcome == Outcome::Failure;
        match inner.state {
            CircuitState::Closed => {
                self.push(&mut inner, failed);
                let minimum = self.config.minimum_calls().max(1);
                if inner.window.len() >= minimum
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::MetricsOnly => self.push(&mut inner, failed),
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if failed {
                    self.transition(&mut inner, CircuitState::Open, now);
                } else {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.permitted_half_open_calls.max(1) {
                        self.transition(&mut inner, CircuitState::Closed, now);
                    }
                }
            }
            CircuitState::Open | CircuitState::Disabled | CircuitState::ForcedOpen => {}
        }
    }

    /// Give back a half-open slot for a call that never reported an outcome.
    pub(crate) fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Move to `state` regardless of the current one (administrative override).
    pub fn transition_to(&self, state: CircuitState) {
        let mut inner = self.lock();
        if inner.state != state {
            self.transition(&mut inner, state, Instant::now());
        }
    }

    fn push(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.window.len() >= self.config.sliding_window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        let rate = inner.failure_rate();
        inner.state = to;
        inner.generation += 1;
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        match to {
            CircuitState::Open => inner.opened_at = Some(now),
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
            }
            _ => {}
        }
        info!(
            endpoint = %self.key,
            from = %from,
            to = %to,
            failure_rate = rate,
            "circuit breaker state changed"
        );
        if let Some(listener) = &self.listener {
            listener(&self.key, from, to);
        }
    }
}
