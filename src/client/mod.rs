//! Rate-limited, bounded-concurrency dispatch for one external endpoint
//! family.
//!
//! Calls are started in FIFO order by a single scheduler task, subject to
//! two caps: at most `max_concurrency` calls in flight, and at least
//! `60s / requests_per_minute` between two dispatches. Completion order is
//! not guaranteed. Each dispatched call runs through the retry policy,
//! retrying only failures the classifier marks retryable; retries happen
//! inside the call's concurrency slot.

pub mod credentials;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use secrecy::SecretString;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

pub use credentials::{
    CommandToken, CredentialChain, CredentialProvider, MetadataToken, StaticToken,
};

use crate::net::{CallError, ErrorClass};
use crate::retry::RetryPolicy;
use crate::telemetry::call::{record_attempts, start_call_span};
use crate::telemetry::metrics;

/// Throughput caps and retry shape for one queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Label for logs and spans (e.g. "imagen", "gemini").
    pub name: String,
    /// Maximum calls in flight at once.
    pub max_concurrency: usize,
    /// Dispatch rate cap. Zero disables interval spacing.
    pub requests_per_minute: u32,
    /// Retry shape applied to every dispatched call.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrency: 2,
            requests_per_minute: 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Minimum spacing between two dispatches.
    pub fn min_interval(&self) -> Duration {
        if self.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(60_000 / u64::from(self.requests_per_minute))
        }
    }
}

type Job = BoxFuture<'static, ()>;

/// Handle to a rate-limited dispatcher. Cheap to clone; all clones feed the
/// same scheduler.
///
/// Must be created inside a Tokio runtime: construction spawns the
/// scheduler task, which stops once every handle is dropped.
#[derive(Clone)]
pub struct RateLimitedQueue {
    config: Arc<QueueConfig>,
    sender: mpsc::UnboundedSender<Job>,
    credentials: Option<Arc<CredentialChain>>,
}

impl RateLimitedQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        tokio::spawn(schedule(receiver, semaphore, config.min_interval()));
        Self {
            config: Arc::new(config),
            sender,
            credentials: None,
        }
    }

    /// Attach the credential chain used by [`enqueue_authorized`](Self::enqueue_authorized).
    pub fn with_credentials(mut self, chain: Arc<CredentialChain>) -> Self {
        self.credentials = Some(chain);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue `op` for dispatch. The call is queued immediately; the returned
    /// future resolves with its final outcome after retries.
    pub fn enqueue<T, F, Fut>(
        &self,
        mut op: F,
    ) -> impl Future<Output = Result<T, CallError>> + Send + 'static + use<T, F, Fut>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let call_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let config = Arc::clone(&self.config);

        let job = async move {
            let span = start_call_span(&config.name, &call_id);
            let outcome = async {
                info!("call.start");
                let mut attempts = 0u32;
                let mut counted = || {
                    attempts += 1;
                    op()
                };
                let result = config
                    .retry
                    .run_notify(&mut counted, CallError::is_retryable, |attempt, e, delay| {
                        metrics::call_retries().add(1, &[KeyValue::new("target", config.name.clone())]);
                        warn!(
                            attempt,
                            class = %e.class,
                            error = %e.message,
                            delay_ms = delay.as_millis() as u64,
                            "call.retry"
                        );
                    })
                    .await;
                record_attempts(&tracing::Span::current(), attempts);
                match &result {
                    Ok(_) => info!(attempts, "call.success"),
                    Err(e) => warn!(attempts, class = %e.class, error = %e.message, "call.failure"),
                }
                result
            }
            .instrument(span)
            .await;
            // The caller may have stopped waiting; the outcome is then dropped.
            let _ = tx.send(outcome);
        }
        .boxed();

        let queued = self.sender.send(job);
        async move {
            if queued.is_err() {
                return Err(CallError::with_class(
                    ErrorClass::Unknown,
                    "queue scheduler has stopped",
                ));
            }
            rx.await.unwrap_or_else(|_| {
                Err(CallError::with_class(
                    ErrorClass::Unknown,
                    "queued call was dropped before settling",
                ))
            })
        }
    }

    /// Like [`enqueue`](Self::enqueue), handing `op` a bearer token from the
    /// credential chain on every attempt. A credential failure is an
    /// `AuthRequired` error; an upstream auth rejection drops the cached
    /// token so the next call walks the chain again.
    pub fn enqueue_authorized<T, F, Fut>(
        &self,
        op: F,
    ) -> impl Future<Output = Result<T, CallError>> + Send + 'static + use<T, F, Fut>
    where
        T: Send + 'static,
        F: Fn(Arc<SecretString>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let credentials = self.credentials.clone();
        let op = Arc::new(op);
        self.enqueue(move || {
            let credentials = credentials.clone();
            let op = Arc::clone(&op);
            async move {
                let chain = credentials.ok_or_else(|| {
                    CallError::with_class(ErrorClass::AuthRequired, "no credential chain configured")
                })?;
                let token = chain
                    .token()
                    .await
                    .map_err(|e| CallError::with_class(ErrorClass::AuthRequired, e.to_string()))?;
                let result = op(token).await;
                if matches!(&result, Err(e) if e.class == ErrorClass::AuthRequired) {
                    chain.invalidate().await;
                }
                result
            }
        })
    }
}

async fn schedule(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
) {
    let mut last_dispatch: Option<Instant> = None;
    while let Some(job) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if let Some(last) = last_dispatch {
            tokio::time::sleep_until(last + min_interval).await;
        }
        last_dispatch = Some(Instant::now());
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }
}
