//! Job runs: claim a batch, process it, report back.
//!
//! A run claims up to `limit` tasks, hands each to a [`TaskHandler`] with
//! bounded in-process concurrency, and settles every task through
//! `complete` or `fail`. Several runs, in this process or others, can work
//! the same backlog at once; the claim store keeps them apart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{Instrument, error, info, warn};

use crate::claim::{FailOutcome, TaskClaimStore, TaskStore};
use crate::client::RateLimitedQueue;
use crate::error::Result;
use crate::model::{Task, TaskState};
use crate::net::{HttpRequest, ResilientCaller, Transport};
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Does the actual work for a claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one task. `Ok` becomes the task's result; `Err` is reported
    /// through `fail` with the error text as the reason.
    async fn handle(&self, task: &Task) -> Result<serde_json::Value>;
}

/// Tally of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub claimed: usize,
    pub done: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Outcomes dropped because the claim had been taken over.
    pub stale: usize,
}

impl RunSummary {
    fn absorb(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Done => self.done += 1,
            TaskOutcome::Failed(FailOutcome::Requeued) => self.requeued += 1,
            TaskOutcome::Failed(FailOutcome::Failed) => self.failed += 1,
            TaskOutcome::Failed(FailOutcome::Stale) | TaskOutcome::Stale => self.stale += 1,
        }
    }
}

enum TaskOutcome {
    Done,
    Stale,
    Failed(FailOutcome),
}

pub struct JobRunner<S, H> {
    claims: Arc<TaskClaimStore<S>>,
    handler: Arc<H>,
    concurrency: usize,
}

impl<S, H> JobRunner<S, H>
where
    S: TaskStore,
    H: TaskHandler,
{
    pub fn new(claims: Arc<TaskClaimStore<S>>, handler: Arc<H>, concurrency: usize) -> Self {
        Self {
            claims,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    /// Claim up to `limit` tasks and process them.
    ///
    /// Handler failures are task outcomes, not errors. Only store errors
    /// surface; when one occurs the remaining tasks still settle, and the
    /// first error is returned.
    pub async fn run_once(&self, limit: usize) -> Result<RunSummary> {
        let tasks = self.claims.claim_batch(limit).await?;
        let mut summary = RunSummary {
            claimed: tasks.len(),
            ..RunSummary::default()
        };
        if tasks.is_empty() {
            return Ok(summary);
        }

        let outcomes: Vec<Result<TaskOutcome>> = stream::iter(tasks)
            .map(|task| self.process(task))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => summary.absorb(outcome),
                Err(e) => {
                    error!(error = %e, "failed to settle task");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            claimed = summary.claimed,
            done = summary.done,
            requeued = summary.requeued,
            failed = summary.failed,
            stale = summary.stale,
            "run finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Keep running batches until a claim comes back empty.
    pub async fn drain(&self, limit: usize) -> Result<RunSummary> {
        let mut total = RunSummary::default();
        loop {
            let run = self.run_once(limit).await?;
            if run.claimed == 0 {
                return Ok(total);
            }
            total.claimed += run.claimed;
            total.done += run.done;
            total.requeued += run.requeued;
            total.failed += run.failed;
            total.stale += run.stale;
        }
    }

    async fn process(&self, task: Task) -> Result<TaskOutcome> {
        let span = start_task_span(&task.kind, &task.id, task.attempts);

        async {
            match self.handler.handle(&task).await {
                Ok(result) => {
                    if self.claims.complete(&task.id, result, task.attempts).await? {
                        record_state_transition(&span, "claimed", TaskState::Done.as_str());
                        Ok(TaskOutcome::Done)
                    } else {
                        Ok(TaskOutcome::Stale)
                    }
                }
                Err(e) => {
                    warn!(error = %e, "task handler failed");
                    let reason = e.to_string();
                    let outcome = self.claims.fail(&task.id, &reason, task.attempts).await?;
                    match outcome {
                        FailOutcome::Requeued => {
                            record_state_transition(&span, "claimed", TaskState::Pending.as_str())
                        }
                        FailOutcome::Failed => {
                            record_state_transition(&span, "claimed", TaskState::Failed.as_str())
                        }
                        FailOutcome::Stale => {}
                    }
                    Ok(TaskOutcome::Failed(outcome))
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}

// ---------------------------------------------------------------------------
// HTTP handler
// ---------------------------------------------------------------------------

/// Posts each task to an HTTP endpoint through the full call stack:
/// single-flight and breaker, then the rate-limited queue with retries,
/// then an authorized request.
///
/// The request body is `{"kind": ..., "payload": ...}`; the JSON response
/// body becomes the task's result. Identical requests in flight at the same
/// time share one upstream call.
pub struct HttpTaskHandler<T> {
    endpoint: String,
    transport: Arc<T>,
    queue: RateLimitedQueue,
    caller: ResilientCaller<serde_json::Value>,
    request_timeout: Duration,
}

impl<T: Transport + 'static> HttpTaskHandler<T> {
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<T>,
        queue: RateLimitedQueue,
        caller: ResilientCaller<serde_json::Value>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            queue,
            caller,
            request_timeout,
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> TaskHandler for HttpTaskHandler<T> {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value> {
        let body = json!({ "kind": task.kind, "payload": task.payload });
        let key = format!("POST {} {body}", self.endpoint);
        let request =
            HttpRequest::post_json(self.endpoint.clone(), body).timeout(self.request_timeout);
        let queue = self.queue.clone();
        let transport = Arc::clone(&self.transport);

        let value = self
            .caller
            .call(&key, move || {
                let request = request.clone();
                let transport = Arc::clone(&transport);
                queue.enqueue_authorized(move |token| {
                    let request = request.clone().bearer(&token);
                    let transport = Arc::clone(&transport);
                    async move { transport.send(request).await?.error_for_status()?.json() }
                })
            })
            .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ClaimPolicy, InMemoryTaskStore};
    use crate::error::Error;
    use crate::model::NewTask;
    use serde_json::json;
    use std::time::Duration;

    /// Succeeds for payloads with `"ok": true`, fails otherwise.
    struct PayloadHandler;

    #[async_trait]
    impl TaskHandler for PayloadHandler {
        async fn handle(&self, task: &Task) -> Result<serde_json::Value> {
            if task.payload["ok"] == json!(true) {
                Ok(json!({"handled": task.kind}))
            } else {
                Err(Error::Other("payload rejected".to_string()))
            }
        }
    }

    fn runner(max_attempts: u32) -> JobRunner<InMemoryTaskStore, PayloadHandler> {
        let claims = TaskClaimStore::new(
            InMemoryTaskStore::new(),
            ClaimPolicy {
                max_attempts,
                stale_after: Duration::from_secs(600),
            },
        );
        JobRunner::new(Arc::new(claims), Arc::new(PayloadHandler), 2)
    }

    #[tokio::test]
    async fn run_settles_every_claimed_task() {
        let r = runner(2);
        let store = r.claims.store();
        for ok in [true, true, false] {
            store
                .insert(NewTask::new("enrich").payload(json!({ "ok": ok })))
                .await
                .unwrap();
        }

        let first = r.run_once(10).await.unwrap();
        assert_eq!(
            first,
            RunSummary {
                claimed: 3,
                done: 2,
                requeued: 1,
                failed: 0,
                stale: 0
            }
        );

        let second = r.run_once(10).await.unwrap();
        assert_eq!((second.claimed, second.failed), (1, 1));

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!((counts.done, counts.failed, counts.pending), (2, 1, 0));
    }

    #[tokio::test]
    async fn drain_stops_when_backlog_is_settled() {
        let r = runner(3);
        let store = r.claims.store();
        store
            .insert(NewTask::new("banner").payload(json!({ "ok": false })))
            .await
            .unwrap();
        store
            .insert(NewTask::new("banner").payload(json!({ "ok": true })))
            .await
            .unwrap();

        let total = r.drain(1).await.unwrap();
        assert_eq!(total.done, 1);
        assert_eq!(total.requeued, 2);
        assert_eq!(total.failed, 1);

        let failed = store.list(Some(TaskState::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("payload rejected"));
    }
}
