//! Single-flight + circuit breaker + classified retry around one call.
//!
//! `call(key, op)` first looks for an in-flight call with the same key and
//! attaches to it. Otherwise it starts a new call on its own task, so the
//! call settles (and its registry entry is removed) even if every waiter
//! goes away. The started call checks the breaker, runs `op` under a hard
//! timeout with backoff on retryable failures, and reports the outcome to
//! the breaker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{CallError, CircuitBreaker, ErrorClass};
use crate::retry::RetryPolicy;
use crate::telemetry::metrics;

/// Timeout and retry shape for guarded calls.
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Hard limit for a single attempt.
    pub timeout: Duration,
    /// Backoff between attempts of a retryable failure.
    pub retry: RetryPolicy,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, CallError>>>;
type InFlight<T> = Arc<Mutex<HashMap<String, SharedCall<T>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resilient caller for one response type.
///
/// Constructed once per process. Callers attached to the same key receive
/// clones of one shared outcome and must treat it as read-only.
pub struct ResilientCaller<T> {
    config: CallerConfig,
    breaker: Arc<CircuitBreaker>,
    in_flight: InFlight<T>,
}

impl<T> Clone for ResilientCaller<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            breaker: Arc::clone(&self.breaker),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> ResilientCaller<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CallerConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Number of distinct keys with a call outstanding.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Call `op` for `key`, coalescing with any outstanding call for the
    /// same key.
    pub async fn call<F, Fut>(&self, key: &str, op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(existing) => {
                    debug!(key, "attaching to in-flight call");
                    existing.clone()
                }
                None => {
                    let handle = tokio::spawn(self.guarded(key.to_string(), op));
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(CallError::with_class(
                                ErrorClass::Unknown,
                                format!("call task aborted: {e}"),
                            ))
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    fn guarded<F, Fut>(
        &self,
        key: String,
        mut op: F,
    ) -> impl Future<Output = Result<T, CallError>> + Send + 'static
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let breaker = Arc::clone(&self.breaker);
        let in_flight = Arc::clone(&self.in_flight);
        let config = self.config.clone();

        async move {
            let started = Instant::now();
            let outcome = run_guarded(&breaker, &config, &key, &mut op).await;
            lock(&in_flight).remove(&key);

            let class = outcome.as_ref().err().map_or("ok", |e| e.class.as_str());
            metrics::call_outcomes().add(1, &[KeyValue::new("class", class)]);
            metrics::call_duration_ms().record(
                started.elapsed().as_millis() as f64,
                &[KeyValue::new("class", class)],
            );
            outcome
        }
    }
}

async fn run_guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    config: &CallerConfig,
    key: &str,
    op: &mut F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    breaker.check(key)?;

    let timeout = config.timeout;
    let mut attempt_once = || {
        let fut = op();
        async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(CallError::timeout(timeout)),
            }
        }
    };

    let result = config
        .retry
        .run_notify(
            &mut attempt_once,
            CallError::is_retryable,
            |attempt, e, delay| {
                warn!(
                    key,
                    attempt,
                    class = %e.class,
                    delay_ms = delay.as_millis() as u64,
                    "retrying call"
                );
                metrics::call_retries().add(1, &[]);
            },
        )
        .await;

    match &result {
        Ok(_) => breaker.record_success(key),
        Err(e) if e.is_retryable() => {
            breaker.record_failure(key);
        }
        // Terminal classes are the caller's problem, not the target's health.
        Err(_) => {}
    }
    result
}
