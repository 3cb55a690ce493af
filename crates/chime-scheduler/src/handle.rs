//! Mutation API: create, edit, cancel, list.
//!
//! Every mutation commits to the store first and only then touches the
//! schedule index, so the loop never sees an entry whose row is missing.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;

use chime_core::traits::{IdentityResolver, TaskStore};
use chime_core::{ChimeError, NewTask, Result, Task, TaskEdit, TaskId};

use crate::engine::{SchedulerState, Shared, at_store_precision};

/// Cloneable handle onto a running (or not yet started) scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn TaskStore>,
    identity: Arc<dyn IdentityResolver>,
    shared: Arc<Shared>,
    min_lead: TimeDelta,
}

impl SchedulerHandle {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        identity: Arc<dyn IdentityResolver>,
        shared: Arc<Shared>,
        min_lead: TimeDelta,
    ) -> Self {
        Self {
            store,
            identity,
            shared,
            min_lead,
        }
    }

    /// Persist a new reminder and schedule it.
    pub async fn create(&self, mut new: NewTask) -> Result<Task> {
        let now = at_store_precision(Utc::now());
        new.trigger_time = at_store_precision(new.trigger_time);
        self.check_time(new.trigger_time, now)?;

        self.identity.ensure(&new.owner).await?;
        if new.target != new.owner {
            self.identity.ensure(&new.target).await?;
        }

        let mut task = new.into_task(now);
        task.id = self.store.insert(&task).await?;
        self.shared.enqueue(task.id, task.trigger_time).await;

        tracing::info!(
            "📅 Reminder {} for {} scheduled at {} ({})",
            task.id,
            task.owner,
            task.trigger_time,
            task.recurrence
                .map(|r| r.to_string())
                .unwrap_or_else(|| "once".into())
        );
        Ok(task)
    }

    /// Apply a partial update. Changing the trigger time re-schedules the
    /// task; the entry for the old time is dropped as stale when popped.
    pub async fn edit(&self, id: TaskId, owner: &str, edit: TaskEdit) -> Result<Task> {
        let _writes = self.shared.write_lock().await;
        let mut task = self.owned(id, owner).await?;
        if !task.is_active {
            return Err(ChimeError::NotFound(id));
        }
        if edit.is_empty() {
            return Ok(task);
        }

        let new_time = edit.trigger_time.map(at_store_precision);
        if let Some(at) = new_time {
            self.check_time(at, Utc::now())?;
        }
        if let Some(target) = &edit.target {
            self.identity.ensure(target).await?;
        }

        let retimed = new_time.filter(|at| *at != task.trigger_time);

        if let Some(target) = edit.target {
            task.target = target;
        }
        if let Some(message) = edit.message {
            task.payload.message = message;
        }
        if let Some(title) = edit.title {
            task.payload.title = title;
        }
        if let Some(mode) = edit.delivery_mode {
            task.delivery_mode = mode;
        }
        if let Some(recurrence) = edit.recurrence {
            if recurrence != task.recurrence {
                task.recurrence = recurrence;
                task.last_fired = None;
            }
        }
        if let Some(at) = retimed {
            task.trigger_time = at;
            task.last_fired = None;
        }

        self.store.update(&task).await?;
        if let Some(at) = retimed {
            self.shared.enqueue(id, at).await;
            tracing::info!("✏️ Reminder {} moved to {}", id, at);
        } else {
            tracing::info!("✏️ Reminder {} updated", id);
        }
        Ok(task)
    }

    /// Soft-cancel (deactivate) or, with `permanent`, delete the row.
    /// The index is left alone; the loop drops the entry when it pops it.
    pub async fn cancel(&self, id: TaskId, owner: &str, permanent: bool) -> Result<()> {
        let _writes = self.shared.write_lock().await;
        let mut task = self.owned(id, owner).await?;
        if permanent {
            self.store.delete(id).await?;
            tracing::info!("🗑️ Reminder {} deleted", id);
            return Ok(());
        }
        if !task.is_active {
            return Err(ChimeError::NotFound(id));
        }
        task.is_active = false;
        self.store.update(&task).await?;
        tracing::info!("🚫 Reminder {} cancelled", id);
        Ok(())
    }

    /// Active, future reminders owned by `owner`, soonest first.
    pub async fn list(&self, owner: &str) -> Result<Vec<Task>> {
        self.store.list_active_for_owner(owner, Utc::now()).await
    }

    /// One reminder, active or not, if `owner` owns it.
    pub async fn get(&self, id: TaskId, owner: &str) -> Result<Task> {
        self.owned(id, owner).await
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.shared.subscribe()
    }

    /// Entries currently waiting in the index (excluding one being waited on).
    pub async fn pending(&self) -> usize {
        self.shared.pending().await
    }

    async fn owned(&self, id: TaskId, owner: &str) -> Result<Task> {
        let task = self
            .store
            .get(id)
            .await?
            .ok_or(ChimeError::NotFound(id))?;
        if task.owner != owner {
            return Err(ChimeError::NotOwner(id));
        }
        Ok(task)
    }

    fn check_time(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if at <= now + self.min_lead {
            return Err(ChimeError::InvalidTime);
        }
        Ok(())
    }
}
