//! In-process task store for tests, demos, and ephemeral bots.
//! Same contract as the SQLite store; nothing survives a restart.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chime_core::traits::TaskStore;
use chime_core::{ChimeError, Result, Task, TaskId};

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<TaskId, Task>,
    last_id: TaskId,
}

/// Memory-backed persistence gateway.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| ChimeError::Store(format!("Lock: {e}")))
    }

    /// Number of rows, active or not.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn active_future(task: &Task, now: DateTime<Utc>) -> bool {
    task.is_active && task.trigger_time > now
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_active_future(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| active_future(t, now))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.trigger_time);
        Ok(tasks)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    async fn insert(&self, task: &Task) -> Result<TaskId> {
        let mut inner = self.lock()?;
        inner.last_id += 1;
        let id = inner.last_id;
        let mut row = task.clone();
        row.id = id;
        inner.tasks.insert(id, row);
        Ok(id)
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.tasks.get_mut(&task.id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => Err(ChimeError::Store(format!(
                "Update: no reminder with id {}",
                task.id
            ))),
        }
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        self.lock()?.tasks.remove(&id);
        Ok(())
    }

    async fn list_active_for_owner(&self, owner: &str, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.owner == owner && active_future(t, now))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.trigger_time);
        Ok(tasks)
    }
}
