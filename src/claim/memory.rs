//! Process-local [`TaskStore`] behind a single async mutex.
//!
//! Every operation holds the lock for its whole duration, which makes
//! `compare_and_set` trivially atomic. Used by tests and by single-process
//! runs that do not need durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{TaskStore, TaskUpdate};
use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskCounts, TaskId, TaskState};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, new: NewTask) -> Result<Task> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&new.id) {
            return Err(Error::Other(format!("task {} already exists", new.id.0)));
        }
        let task = new.into_task(Utc::now());
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn candidates(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        let mut found: Vec<Task> = tasks
            .values()
            .filter(|t| t.is_claimable(stale_before, max_attempts))
            .cloned()
            .collect();
        oldest_first(&mut found);
        found.truncate(limit);
        Ok(found)
    }

    async fn exhausted_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        let mut found: Vec<Task> = tasks
            .values()
            .filter(|t| t.claim_is_stale(stale_before) && t.attempts >= max_attempts)
            .cloned()
            .collect();
        oldest_first(&mut found);
        Ok(found)
    }

    async fn compare_and_set(
        &self,
        id: &TaskId,
        expected_state: TaskState,
        expected_attempts: u32,
        update: TaskUpdate,
    ) -> Result<u64> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(id) {
            Some(task) if task.state == expected_state && task.attempts == expected_attempts => {
                update.apply(task, Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn counts_by_state(&self) -> Result<TaskCounts> {
        let tasks = self.tasks.lock().await;
        let mut counts = TaskCounts::default();
        for task in tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        let mut found: Vec<Task> = tasks
            .values()
            .filter(|t| state.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        oldest_first(&mut found);
        found.truncate(limit);
        Ok(found)
    }
}
