//! Test doubles shared by the engine, handle and reconcile tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};

use chime_core::traits::{Deliverer, TaskStore};
use chime_core::{ChimeError, DeliveryError, DeliveryMode, Notification, Result, Task, TaskId};

use crate::store::MemoryTaskStore;

/// One successful delivery.
#[derive(Debug, Clone)]
pub(crate) struct Delivered {
    pub destination: String,
    pub mode: DeliveryMode,
    pub notification: Notification,
}

/// Deliverer that reports successful deliveries on a channel.
pub(crate) struct RecordingDeliverer {
    tx: mpsc::UnboundedSender<Delivered>,
    unreachable: HashSet<String>,
    broken: bool,
}

impl RecordingDeliverer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deliverer = Self {
            tx,
            unreachable: HashSet::new(),
            broken: false,
        };
        (deliverer, rx)
    }

    /// Deliveries to `destination` fail with `Unreachable`.
    pub fn unreachable(mut self, destination: &str) -> Self {
        self.unreachable.insert(destination.to_string());
        self
    }

    /// Every delivery fails with a transport error.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(
        &self,
        destination: &str,
        mode: DeliveryMode,
        notification: &Notification,
    ) -> std::result::Result<(), DeliveryError> {
        if self.broken {
            return Err(DeliveryError::Other("connection reset".into()));
        }
        if self.unreachable.contains(destination) {
            return Err(DeliveryError::Unreachable(format!("{destination} blocked the bot")));
        }
        let _ = self.tx.send(Delivered {
            destination: destination.to_string(),
            mode,
            notification: notification.clone(),
        });
        Ok(())
    }
}

/// Memory store whose reads and updates can be made to fail or stall.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryTaskStore,
    fail_updates: AtomicBool,
    failing_gets: AtomicUsize,
    hold_update: AtomicBool,
    update_held: Notify,
    update_released: Notify,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// The next `n` calls to `get` fail.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// The next `update` blocks before writing until [`release_update`](Self::release_update).
    pub fn hold_next_update(&self) {
        self.hold_update.store(true, Ordering::SeqCst);
    }

    /// Resolves once the held update is parked.
    pub async fn update_held(&self) {
        self.update_held.notified().await;
    }

    pub fn release_update(&self) {
        self.update_released.notify_one();
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn load_active_future(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.inner.load_active_future(now).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let failing = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChimeError::Store("database is locked".into()));
        }
        self.inner.get(id).await
    }

    async fn insert(&self, task: &Task) -> Result<TaskId> {
        self.inner.insert(task).await
    }

    async fn update(&self, task: &Task) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ChimeError::Store("disk I/O error".into()));
        }
        if self.hold_update.swap(false, Ordering::SeqCst) {
            self.update_held.notify_one();
            self.update_released.notified().await;
        }
        self.inner.update(task).await
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn list_active_for_owner(&self, owner: &str, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.inner.list_active_for_owner(owner, now).await
    }
}

/// Poll the store until `pred` holds for task `id`; panics after 5s.
pub(crate) async fn eventually(
    store: &dyn TaskStore,
    id: TaskId,
    pred: impl Fn(Option<&Task>) -> bool,
) -> Option<Task> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.get(id).await.unwrap();
        if pred(task.as_ref()) {
            return task;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition on task {id} never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
