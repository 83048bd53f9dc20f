//! Core data model.
//!
//! A task is one unit of pipeline work sitting in the shared backlog. The
//! claim machinery only ever touches `state`, `attempts`, `last_claimed_at`,
//! `result` and `last_error`; `kind` and `payload` belong to the producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,

    /// What kind of work this is (e.g. "banner", "enrich").
    pub kind: String,

    /// Producer-defined parameters. Opaque to the claim machinery.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Number of successful claims so far. Never decreases.
    pub attempts: u32,

    /// Set on every successful claim; used to detect abandoned claims.
    pub last_claimed_at: Option<DateTime<Utc>>,

    /// Set when the task reaches `Done`.
    pub result: Option<serde_json::Value>,

    /// Last failure reason.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Was this task claimed at or before `stale_before`?
    pub fn claim_is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.state == TaskState::Claimed
            && self.last_claimed_at.is_none_or(|at| at <= stale_before)
    }

    /// Could a claim with the given attempt cap pick this task up?
    pub fn is_claimable(&self, stale_before: DateTime<Utc>, max_attempts: u32) -> bool {
        self.attempts < max_attempts
            && (self.state == TaskState::Pending || self.claim_is_stale(stale_before))
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// Pending -> Claimed -> Done
///                    -> Pending   (retry, attempts < max)
///                    -> Failed    (attempts >= max, terminal)
/// Claimed (stale) -> Claimed      (reclaimed by another run)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the backlog.
    Pending,
    /// Held by a job run.
    Claimed,
    /// Finished successfully. Terminal.
    Done,
    /// Exhausted its attempts. Terminal.
    Failed,
}

impl TaskState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, Claimed) // stale reclaim
                | (Claimed, Done)
                | (Claimed, Pending)
                | (Claimed, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "claimed" => Ok(TaskState::Claimed),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            other => Err(Error::Other(format!("unknown task state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Backlog size per state, for operator reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState, n: u64) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Claimed => self.claimed += n,
            TaskState::Done => self.done += n,
            TaskState::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.failed
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new backlog entries. Producers use this to submit work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) id: TaskId,
    pub(crate) kind: String,
    pub(crate) payload: serde_json::Value,
}

impl NewTask {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            kind: kind.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Use a caller-chosen ID instead of a random one.
    pub fn id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Materialize as a fresh `Pending` task.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: self.id,
            kind: self.kind,
            payload: self.payload,
            state: TaskState::Pending,
            attempts: 0,
            last_claimed_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
