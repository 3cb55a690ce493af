//! Persistence gateway trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::task::{Task, TaskId};

/// Source of truth for tasks. Must give read-your-writes per task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Backend name (for logs).
    fn name(&self) -> &str;

    /// All tasks with `is_active` and `trigger_time > now`.
    async fn load_active_future(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Fetch one task, active or not.
    async fn get(&self, id: TaskId) -> Result<Option<Task>>;

    /// Insert a new row, ignoring `task.id`; returns the assigned id.
    async fn insert(&self, task: &Task) -> Result<TaskId>;

    /// Overwrite an existing row.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Delete a row. Deleting a missing id is not an error.
    async fn delete(&self, id: TaskId) -> Result<()>;

    /// Active future tasks of one owner, ordered by trigger time.
    async fn list_active_for_owner(&self, owner: &str, now: DateTime<Utc>) -> Result<Vec<Task>>;
}
