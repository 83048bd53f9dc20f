//! Per-key circuit breaker.
//!
//! ```text
//! Closed --(failure_count reaches threshold)--> Open
//! Open --(cooldown elapses)--> HalfOpen
//! HalfOpen --(success)--> Closed
//! HalfOpen --(exhausted failure)--> Open, cooldown restarts
//! ```
//!
//! State is process-local and lost on restart. Two processes hitting the
//! same failing endpoint each trip their own breaker independently.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::CallError;
use crate::telemetry::metrics;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Exhausted failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Recorded state for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitState {
    /// Exhausted failures since the last success. Does not decay.
    pub failure_count: u32,
    /// Calls are rejected while `now < open_until`.
    pub open_until: Option<Instant>,
}

/// Observable phase derived from [`CircuitState`] and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn phase(&self, now: Instant) -> BreakerPhase {
        match self.open_until {
            Some(until) if now < until => BreakerPhase::Open,
            Some(_) => BreakerPhase::HalfOpen,
            None => BreakerPhase::Closed,
        }
    }
}

/// Circuit breakers for every call-target key seen by this process.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, CircuitState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject fast if the breaker for `key` is open.
    pub fn check(&self, key: &str) -> Result<(), CallError> {
        let now = Instant::now();
        match self.states().get(key) {
            Some(state) if state.phase(now) == BreakerPhase::Open => {
                Err(CallError::circuit_open(key))
            }
            _ => Ok(()),
        }
    }

    /// A call for `key` succeeded: close the breaker and forget failures.
    pub fn record_success(&self, key: &str) {
        let mut states = self.states();
        if let Some(state) = states.get_mut(key) {
            if state.open_until.is_some() {
                info!(key, "circuit closed");
            }
            *state = CircuitState::default();
        }
    }

    /// A call for `key` exhausted its retries. Returns true if this
    /// failure opened (or re-opened) the breaker.
    pub fn record_failure(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut states = self.states();
        let state = states.entry(key.to_string()).or_default();
        state.failure_count = state.failure_count.saturating_add(1);

        if state.failure_count < self.config.failure_threshold {
            return false;
        }

        state.open_until = Some(now + self.config.cooldown);
        warn!(
            key,
            failure_count = state.failure_count,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "circuit opened"
        );
        metrics::breaker_opened().add(1, &[]);
        true
    }

    /// Snapshot of the state for `key` (default if never seen).
    pub fn state(&self, key: &str) -> CircuitState {
        self.states().get(key).copied().unwrap_or_default()
    }

    pub fn phase(&self, key: &str) -> BreakerPhase {
        self.state(key).phase(Instant::now())
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &str) {
        self.states().remove(key);
    }
}
