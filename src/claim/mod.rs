//! Claim-based task state machine over a shared backlog.
//!
//! Any number of job runs, in any number of processes, may call
//! [`TaskClaimStore::claim`] against the same store. Mutual exclusion comes
//! from conditional writes: a transition only lands if the row still has the
//! state and attempt count the writer read. A writer that matches zero rows
//! lost the race and simply skips the task.
//!
//! `complete` and `fail` are keyed on the attempt count observed at claim
//! time, so a worker whose claim went stale and was taken over cannot
//! clobber the newer claim's outcome.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

pub use memory::InMemoryTaskStore;

use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskCounts, TaskId, TaskState};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Store boundary
// ---------------------------------------------------------------------------

/// A state change applied by a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// `-> Claimed`, bump `attempts`, stamp `last_claimed_at`.
    Claim { at: DateTime<Utc> },
    /// `-> Done` with a result payload.
    Complete { result: serde_json::Value },
    /// `-> Pending` for another attempt.
    Release { error: String },
    /// `-> Failed`, terminal.
    Kill { error: String },
}

impl TaskUpdate {
    pub fn target_state(&self) -> TaskState {
        match self {
            TaskUpdate::Claim { .. } => TaskState::Claimed,
            TaskUpdate::Complete { .. } => TaskState::Done,
            TaskUpdate::Release { .. } => TaskState::Pending,
            TaskUpdate::Kill { .. } => TaskState::Failed,
        }
    }

    /// Apply to an in-memory copy of the row. A claim stamps both
    /// `last_claimed_at` and `updated_at` with its own `at`, so every copy
    /// of the claimed row agrees; other updates use `now`.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        task.state = self.target_state();
        task.updated_at = match self {
            TaskUpdate::Claim { at } => *at,
            _ => now,
        };
        match self {
            TaskUpdate::Claim { at } => {
                task.attempts += 1;
                task.last_claimed_at = Some(*at);
            }
            TaskUpdate::Complete { result } => task.result = Some(result.clone()),
            TaskUpdate::Release { error } | TaskUpdate::Kill { error } => {
                task.last_error = Some(error.clone());
            }
        }
    }
}

/// Durable backlog storage.
///
/// Implementations must make [`compare_and_set`](TaskStore::compare_and_set)
/// atomic: the update lands only if the row's current `state` and
/// `attempts` equal the expected values, and the returned count says
/// whether it did.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, new: NewTask) -> Result<Task>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Claimable tasks, oldest first: `Pending`, or `Claimed` with a claim
    /// older than `stale_before`, and `attempts < max_attempts`.
    async fn candidates(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Stale claims that have no attempts left.
    async fn exhausted_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Task>>;

    /// Conditional write. Returns the number of rows changed (0 or 1).
    async fn compare_and_set(
        &self,
        id: &TaskId,
        expected_state: TaskState,
        expected_attempts: u32,
        update: TaskUpdate,
    ) -> Result<u64>;

    async fn counts_by_state(&self) -> Result<TaskCounts>;

    /// Tasks oldest first, optionally filtered by state.
    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>>;
}

// ---------------------------------------------------------------------------
// Policy and outcomes
// ---------------------------------------------------------------------------

/// Attempt cap and abandonment window.
#[derive(Debug, Clone)]
pub struct ClaimPolicy {
    pub max_attempts: u32,
    /// A claim older than this is presumed crashed and may be taken over.
    pub stale_after: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

/// What `fail` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `Pending` for another attempt.
    Requeued,
    /// Out of attempts; now `Failed`.
    Failed,
    /// The claim was no longer ours; nothing changed.
    Stale,
}

fn validate_transition(from: TaskState, to: TaskState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

fn record_transition(from: TaskState, to: TaskState) {
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

// ---------------------------------------------------------------------------
// TaskClaimStore
// ---------------------------------------------------------------------------

/// Claim / complete / fail on top of a [`TaskStore`].
pub struct TaskClaimStore<S> {
    store: S,
    policy: ClaimPolicy,
}

impl<S: TaskStore> TaskClaimStore<S> {
    pub fn new(store: S, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    /// Claim up to `limit` tasks using the policy's attempt cap.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<Task>> {
        self.claim(limit, self.policy.max_attempts).await
    }

    /// Claim up to `limit` tasks with fewer than `max_attempts` attempts.
    ///
    /// Returns only the tasks this call actually won, each with `attempts`
    /// already incremented. Tasks lost to a concurrent claimer are skipped.
    pub async fn claim(&self, limit: usize, max_attempts: u32) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let stale_before = now - self.stale_window()?;

        self.reap_exhausted(stale_before).await?;

        let candidates = self
            .store
            .candidates(stale_before, max_attempts, limit)
            .await?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut task in candidates {
            validate_transition(task.state, TaskState::Claimed)?;
            let update = TaskUpdate::Claim { at: now };
            let rows = self
                .store
                .compare_and_set(&task.id, task.state, task.attempts, update.clone())
                .await?;

            if rows == 0 {
                debug!(task_id = %task.id, "claim lost to another worker");
                metrics::claim_conflicts().add(1, &[]);
                continue;
            }

            let from = task.state;
            if from == TaskState::Claimed {
                warn!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    "reclaimed abandoned task"
                );
            }
            update.apply(&mut task, now);
            record_transition(from, TaskState::Claimed);
            metrics::tasks_claimed().add(1, &[KeyValue::new("kind", task.kind.clone())]);
            claimed.push(task);
        }

        info!(requested = limit, claimed = claimed.len(), "claim batch");
        Ok(claimed)
    }

    /// Mark a claimed task done.
    ///
    /// `attempts` is the value returned by `claim`. Returns `false`, and
    /// changes nothing, if the task has since been reclaimed or settled.
    pub async fn complete(
        &self,
        id: &TaskId,
        result: serde_json::Value,
        attempts: u32,
    ) -> Result<bool> {
        validate_transition(TaskState::Claimed, TaskState::Done)?;
        let rows = self
            .store
            .compare_and_set(id, TaskState::Claimed, attempts, TaskUpdate::Complete { result })
            .await?;

        if rows == 0 {
            self.log_stale_report(id, attempts, "complete").await?;
            return Ok(false);
        }
        record_transition(TaskState::Claimed, TaskState::Done);
        info!(task_id = %id, attempts, "task done");
        Ok(true)
    }

    /// Report a failed attempt.
    ///
    /// With attempts left the task goes back to `Pending`; otherwise it
    /// becomes `Failed`. Either way `reason` is kept as `last_error`.
    pub async fn fail(&self, id: &TaskId, reason: &str, attempts: u32) -> Result<FailOutcome> {
        let (update, outcome) = if attempts >= self.policy.max_attempts {
            (
                TaskUpdate::Kill {
                    error: reason.to_string(),
                },
                FailOutcome::Failed,
            )
        } else {
            (
                TaskUpdate::Release {
                    error: reason.to_string(),
                },
                FailOutcome::Requeued,
            )
        };
        let to = update.target_state();
        validate_transition(TaskState::Claimed, to)?;

        let rows = self
            .store
            .compare_and_set(id, TaskState::Claimed, attempts, update)
            .await?;
        if rows == 0 {
            self.log_stale_report(id, attempts, "fail").await?;
            return Ok(FailOutcome::Stale);
        }

        record_transition(TaskState::Claimed, to);
        match outcome {
            FailOutcome::Failed => warn!(task_id = %id, attempts, reason, "task failed permanently"),
            _ => info!(task_id = %id, attempts, reason, "task requeued"),
        }
        Ok(outcome)
    }

    /// Move stale claims that have used up the policy's attempts to
    /// `Failed`, so they do not sit in `Claimed` forever. The cap is the
    /// one `fail` uses; a caller's narrower `claim` cap never kills a task.
    async fn reap_exhausted(&self, stale_before: DateTime<Utc>) -> Result<()> {
        let max_attempts = self.policy.max_attempts;
        for task in self.store.exhausted_stale(stale_before, max_attempts).await? {
            let error = format!("claim abandoned after {} attempts", task.attempts);
            let rows = self
                .store
                .compare_and_set(
                    &task.id,
                    TaskState::Claimed,
                    task.attempts,
                    TaskUpdate::Kill { error },
                )
                .await?;
            if rows == 1 {
                record_transition(TaskState::Claimed, TaskState::Failed);
                warn!(task_id = %task.id, attempts = task.attempts, "abandoned task out of attempts");
            }
        }
        Ok(())
    }

    async fn log_stale_report(&self, id: &TaskId, attempts: u32, op: &str) -> Result<()> {
        match self.store.get(id).await? {
            Some(current) => info!(
                task_id = %id,
                op,
                reported_attempts = attempts,
                current_attempts = current.attempts,
                current_state = %current.state,
                "ignoring report for a claim that is no longer held"
            ),
            None => warn!(task_id = %id, op, "report for unknown task"),
        }
        Ok(())
    }

    fn stale_window(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.policy.stale_after)
            .map_err(|e| Error::Config(format!("claim stale window out of range: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(max_attempts: u32) -> TaskClaimStore<InMemoryTaskStore> {
        TaskClaimStore::new(
            InMemoryTaskStore::new(),
            ClaimPolicy {
                max_attempts,
                stale_after: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn claim_increments_attempts_and_stamps_time() {
        let s = store(3);
        let task = s.store().insert(NewTask::new("banner")).await.unwrap();

        let claimed = s.claim(1, 3).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, task.id);
        assert_eq!(claimed[0].state, TaskState::Claimed);
        assert_eq!(claimed[0].attempts, 1);
        assert!(claimed[0].last_claimed_at.is_some());

        let stored = s.store().get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored, claimed[0]);
        assert_eq!(Some(stored.updated_at), stored.last_claimed_at);
    }

    #[tokio::test]
    async fn zero_limit_claims_nothing() {
        let s = store(3);
        s.store().insert(NewTask::new("banner")).await.unwrap();
        assert!(s.claim(0, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_requeues_then_fails_terminally() {
        let s = store(2);
        let task = s.store().insert(NewTask::new("banner")).await.unwrap();

        let first = s.claim_batch(1).await.unwrap().remove(0);
        let outcome = s.fail(&first.id, "upstream 503", first.attempts).await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued);

        let second = s.claim_batch(1).await.unwrap().remove(0);
        assert_eq!(second.attempts, 2);
        let outcome = s.fail(&second.id, "upstream 503", second.attempts).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let stored = s.store().get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("upstream 503"));
        assert!(s.claim_batch(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_with_old_generation_is_ignored() {
        let s = store(3);
        let task = s.store().insert(NewTask::new("enrich")).await.unwrap();
        let claimed = s.claim_batch(1).await.unwrap().remove(0);

        assert!(!s.complete(&task.id, json!({"ok": true}), claimed.attempts + 1).await.unwrap());
        assert_eq!(
            s.fail(&task.id, "late", claimed.attempts - 1).await.unwrap(),
            FailOutcome::Stale
        );
        assert!(s.complete(&task.id, json!({"ok": true}), claimed.attempts).await.unwrap());

        let stored = s.store().get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Done);
        assert_eq!(stored.result, Some(json!({"ok": true})));

        // Already done: a second report is stale too.
        assert!(!s.complete(&task.id, json!(null), claimed.attempts).await.unwrap());
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimed_and_old_worker_cannot_finish() {
        let s = TaskClaimStore::new(
            InMemoryTaskStore::new(),
            ClaimPolicy {
                max_attempts: 3,
                stale_after: Duration::ZERO,
            },
        );
        let task = s.store().insert(NewTask::new("banner")).await.unwrap();

        let first = s.claim_batch(1).await.unwrap().remove(0);
        // With a zero window every claim is immediately stale.
        let second = s.claim_batch(1).await.unwrap().remove(0);
        assert_eq!(second.id, task.id);
        assert_eq!(second.attempts, 2);

        assert!(!s.complete(&task.id, json!("old"), first.attempts).await.unwrap());
        assert!(s.complete(&task.id, json!("new"), second.attempts).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_stale_claim_is_failed() {
        let s = TaskClaimStore::new(
            InMemoryTaskStore::new(),
            ClaimPolicy {
                max_attempts: 1,
                stale_after: Duration::ZERO,
            },
        );
        let task = s.store().insert(NewTask::new("banner")).await.unwrap();
        s.claim_batch(1).await.unwrap();

        assert!(s.claim_batch(1).await.unwrap().is_empty());
        let stored = s.store().get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("claim abandoned after 1 attempts")
        );
    }

    #[tokio::test]
    async fn narrow_claim_cap_leaves_stale_tasks_with_attempts_left() {
        let s = TaskClaimStore::new(
            InMemoryTaskStore::new(),
            ClaimPolicy {
                max_attempts: 3,
                stale_after: Duration::ZERO,
            },
        );
        let task = s.store().insert(NewTask::new("banner")).await.unwrap();
        s.claim_batch(1).await.unwrap();

        assert!(s.claim(1, 1).await.unwrap().is_empty());
        let stored = s.store().get(&task.id).await.unwrap().unwrap();
        assert_eq!((stored.state, stored.attempts), (TaskState::Claimed, 1));
        assert_eq!(stored.last_error, None);

        // Still reclaimable under the policy cap.
        let again = s.claim_batch(1).await.unwrap();
        assert_eq!(again[0].attempts, 2);
    }

    #[test]
    fn updates_target_expected_states() {
        let now = Utc::now();
        let mut task = NewTask::new("x").into_task(now);
        TaskUpdate::Claim { at: now }.apply(&mut task, now);
        assert_eq!((task.state, task.attempts), (TaskState::Claimed, 1));
        TaskUpdate::Release { error: "e".into() }.apply(&mut task, now);
        assert_eq!((task.state, task.attempts), (TaskState::Pending, 1));
        assert_eq!(task.last_error.as_deref(), Some("e"));
    }
}
