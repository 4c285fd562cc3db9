//! Per-endpoint circuit breakers.
//!
//! The registry lazily creates one [`CircuitBreaker`] per endpoint key and
//! keeps at most [`CircuitBreakerConfig::max_breakers`] of them, evicting the
//! least recently used. A rejected call never reaches the transport and is
//! never recorded as a failure.

mod breaker;

pub use breaker::{CircuitBreaker, CircuitState, Outcome};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// Callback invoked with `(endpoint key, from, to)` on every state change.
pub type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Tuning shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls considered.
    pub sliding_window_size: usize,
    /// Calls required in the window before the rate is evaluated; `None`
    /// means a full window.
    pub minimum_number_of_calls: Option<usize>,
    /// Failure rate, in percent, at which the circuit opens.
    pub failure_rate_threshold: f32,
    /// Time spent open before a probe call is let through.
    pub wait_duration_in_open_state: Duration,
    /// Concurrent probe calls allowed while half-open.
    pub permitted_half_open_calls: u32,
    /// Upper bound on cached breakers.
    pub max_breakers: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 100,
            minimum_number_of_calls: None,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_half_open_calls: 1,
            max_breakers: 1000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Effective minimum number of calls.
    pub fn minimum_calls(&self) -> usize {
        self.minimum_number_of_calls
            .unwrap_or(self.sliding_window_size)
            .min(self.sliding_window_size)
    }
}

/// Answer to "may this call proceed?".
#[derive(Debug)]
pub enum Decision {
    /// The call may proceed; report its outcome through the permit.
    Allowed(Permit),
    /// The circuit is open for this endpoint.
    Rejected,
}

/// Proof that a call was allowed. Dropping it unrecorded frees the half-open
/// slot it may hold.
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    recorded: bool,
}

impl Permit {
    /// Endpoint key the permit was issued for.
    pub fn key(&self) -> &str {
        self.breaker.key()
    }

    /// Record the call outcome.
    pub fn record(self, outcome: Outcome) {
        self.record_at(outcome, Instant::now());
    }

    /// [`Permit::record`] with an explicit clock.
    pub fn record_at(mut self, outcome: Outcome, now: Instant) {
        self.recorded = true;
        self.breaker.record_at(self.generation, outcome, now);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release(self.generation);
        }
    }
}

/// LRU-bounded map of endpoint key to breaker.
pub struct CircuitBreakerRegistry {
    config: Arc<CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    tick: AtomicU64,
    listener: Option<StateListener>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            breakers: DashMap::new(),
            tick: AtomicU64::new(0),
            listener: None,
        }
    }

    /// Attach a state-change listener; applies to breakers created afterwards.
    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Registry configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call to `key` may proceed now.
    pub fn try_acquire(&self, key: &str) -> Decision {
        self.try_acquire_at(key, Instant::now())
    }

    /// Like [`CircuitBreakerRegistry::try_acquire`], but a rejection is
    /// reported as [`Error::CircuitOpen`] naming the endpoint.
    pub fn acquire(&self, key: &str) -> Result<Permit> {
        match self.try_acquire(key) {
            Decision::Allowed(permit) => Ok(permit),
            Decision::Rejected => Err(Error::CircuitOpen(key.to_string())),
        }
    }

    /// [`CircuitBreakerRegistry::try_acquire`] with an explicit clock.
    pub fn try_acquire_at(&self, key: &str, now: Instant) -> Decision {
        let breaker = self.breaker(key);
        match breaker.try_acquire_at(now) {
            Some(generation) => Decision::Allowed(Permit {
                breaker,
                generation,
                recorded: false,
            }),
            None => Decision::Rejected,
        }
    }

    /// Current state for a key, if a breaker exists.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    /// Snapshot of every cached breaker's state, sorted by key.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Administratively move a breaker to `state`, creating it if needed.
    pub fn transition(&self, key: &str, state: CircuitState) {
        self.breaker(key).transition_to(state);
    }

    /// Force a breaker back to closed with an empty window.
    pub fn reset(&self, key: &str) {
        self.transition(key, CircuitState::Closed);
    }

    /// Number of cached breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let mut created = false;
        let breaker = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(CircuitBreaker::new(
                    key,
                    self.config.clone(),
                    self.listener.clone(),
                ))
            })
            .clone();
        breaker.touch(tick);
        if created && self.breakers.len() > self.config.max_breakers {
            self.evict_lru(key);
        }
        breaker
    }

    fn evict_lru(&self, keep: &str) {
        let victim = self
            .breakers
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| entry.value().last_used())
            .map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            debug!(endpoint = %victim, "evicting least recently used circuit breaker");
            self.breakers.remove(&victim);
        }
    }
}
