//! Postgres-backed task backlog.
//!
//! Conditional writes are single `UPDATE ... WHERE id AND state AND
//! attempts` statements; `rows_affected()` tells the claim layer whether
//! it won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::claim::{TaskStore, TaskUpdate};
use crate::error::Result;
use crate::model::{NewTask, Task, TaskCounts, TaskId, TaskState};

const COLUMNS: &str = "id, kind, payload, state, attempts, last_claimed_at, result, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, new: NewTask) -> Result<Task> {
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO tasks (id, kind, payload, state, attempts, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', 0, now(), now())
             RETURNING {COLUMNS}"
        ))
        .bind(new.id.0)
        .bind(&new.kind)
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_task()
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn candidates(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tasks
             WHERE attempts < $2
               AND (state = 'pending'
                    OR (state = 'claimed' AND (last_claimed_at IS NULL OR last_claimed_at <= $1)))
             ORDER BY created_at ASC, id ASC
             LIMIT $3"
        ))
        .bind(stale_before)
        .bind(to_i32(max_attempts))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn exhausted_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tasks
             WHERE state = 'claimed'
               AND attempts >= $2
               AND (last_claimed_at IS NULL OR last_claimed_at <= $1)
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(stale_before)
        .bind(to_i32(max_attempts))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn compare_and_set(
        &self,
        id: &TaskId,
        expected_state: TaskState,
        expected_attempts: u32,
        update: TaskUpdate,
    ) -> Result<u64> {
        let to = update.target_state();
        let (increment, claimed_at, result, error) = match &update {
            TaskUpdate::Claim { at } => (1i32, Some(*at), None, None),
            TaskUpdate::Complete { result } => (0, None, Some(result), None),
            TaskUpdate::Release { error } | TaskUpdate::Kill { error } => {
                (0, None, None, Some(error.as_str()))
            }
        };

        let rows_affected = sqlx::query(
            "UPDATE tasks SET
                 state = $4,
                 attempts = attempts + $5,
                 last_claimed_at = COALESCE($6, last_claimed_at),
                 result = COALESCE($7, result),
                 last_error = COALESCE($8, last_error),
                 updated_at = COALESCE($6, now())
             WHERE id = $1 AND state = $2 AND attempts = $3",
        )
        .bind(id.0)
        .bind(expected_state.as_str())
        .bind(to_i32(expected_attempts))
        .bind(to.as_str())
        .bind(increment)
        .bind(claimed_at)
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected)
    }

    async fn counts_by_state(&self) -> Result<TaskCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = TaskCounts::default();
        for (state, n) in rows {
            counts.add(state.parse()?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tasks
             WHERE ($1::text IS NULL OR state = $1)
             ORDER BY created_at ASC, id ASC
             LIMIT $2"
        ))
        .bind(state.map(TaskState::as_str))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    state: String,
    attempts: i32,
    last_claimed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            kind: self.kind,
            payload: self.payload,
            state: self.state.parse()?,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            last_claimed_at: self.last_claimed_at,
            result: self.result,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
