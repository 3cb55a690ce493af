//! Scheduler engine: the single loop that waits on the schedule index and
//! fires reminders.
//!
//! ```text
//!   Idle ──pop──▶ Waiting(id, at) ──sleep elapsed──▶ Dispatching(id) ──▶ (loop)
//!    ▲  ╲            │ gate kicked: push entry back, re-pop
//!    │   ╲ gate      ▼
//!    └────╲──────── (loop)            shutdown from any state ──▶ Stopped
//! ```
//!
//! The loop is the only component that reads the store at fire time, calls
//! the deliverer, and writes completion state back. Mutations only push into
//! the index and kick the gate (see [`SchedulerHandle`]).
//!
//! Every read-modify-write of a task row (edit, cancel, completion) runs under
//! [`Shared::write_lock`], so a completion can never overwrite an edit that
//! has already been acknowledged, and vice versa.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chime_core::config::SchedulerConfig;
use chime_core::traits::{Deliverer, IdentityResolver, NoopResolver, TaskStore};
use chime_core::{DeliveryError, DeliveryMode, Notification, Result, Task, TaskId};

use crate::gate::InterruptGate;
use crate::handle::SchedulerHandle;
use crate::index::{Entry, ScheduleIndex};
use crate::recurrence::next_occurrence;

/// Observable loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Index empty; waiting for a kick.
    Idle,
    /// Sleeping until `at` (or a kick) for task `id`.
    Waiting { id: TaskId, at: DateTime<Utc> },
    /// Revalidating and firing task `id`.
    Dispatching { id: TaskId },
    /// Shut down.
    Stopped,
}

/// Index and gate live under one lock so that "pop + arm" is atomic with
/// respect to "push + kick".
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    pub(crate) index: ScheduleIndex,
    pub(crate) gate: InterruptGate,
}

/// State shared between the loop and every [`SchedulerHandle`].
pub(crate) struct Shared {
    schedule: Mutex<Schedule>,
    writes: Mutex<()>,
    state: watch::Sender<SchedulerState>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            schedule: Mutex::new(Schedule::default()),
            writes: Mutex::new(()),
            state,
        }
    }

    /// Held across a task's read-modify-write. Taken before the schedule lock
    /// whenever both are needed.
    pub(crate) async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    /// Push an entry and wake the loop.
    pub(crate) async fn enqueue(&self, id: TaskId, at: DateTime<Utc>) {
        let mut schedule = self.schedule.lock().await;
        schedule.index.push(id, at);
        schedule.gate.kick();
    }

    /// Push many entries with a single kick. Returns how many were pushed
    /// and the soonest entry now in the index.
    pub(crate) async fn seed(&self, entries: impl IntoIterator<Item = Entry>) -> (usize, Option<Entry>) {
        let mut schedule = self.schedule.lock().await;
        let before = schedule.index.len();
        for entry in entries {
            schedule.index.push_entry(entry);
        }
        schedule.gate.kick();
        (schedule.index.len() - before, schedule.index.peek_min().copied())
    }

    /// Put an entry back without kicking (the loop itself is the caller).
    async fn requeue(&self, entry: Entry) {
        self.schedule.lock().await.index.push_entry(entry);
    }

    /// Pop the soonest entry and arm the gate in one critical section.
    async fn pop_and_arm(&self) -> (Option<Entry>, CancellationToken) {
        let mut schedule = self.schedule.lock().await;
        let entry = schedule.index.pop_min();
        (entry, schedule.gate.arm())
    }

    /// Drop every pending entry; the store stays the record of what is due.
    async fn clear(&self) -> usize {
        let mut schedule = self.schedule.lock().await;
        let dropped = schedule.index.len();
        schedule.index.clear();
        dropped
    }

    pub(crate) async fn pending(&self) -> usize {
        self.schedule.lock().await.index.len()
    }

    pub(crate) fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }
}

/// Result of one delivery attempt (including fallback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    FellBack,
    Failed,
}

/// What happened to a popped entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Task gone or cancelled.
    Dropped,
    /// Store time moved away from the popped time.
    Stale,
    /// Store read failed; the entry was pushed back for a later retry.
    Deferred,
    /// Shutdown requested before firing.
    Aborted,
    Fired(Delivery),
}

enum Wake {
    Due,
    Interrupted,
    Shutdown,
}

/// The scheduler: owns the loop and hands out [`SchedulerHandle`]s.
pub struct Scheduler {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) deliverer: Arc<dyn Deliverer>,
    pub(crate) identity: Arc<dyn IdentityResolver>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) tolerance: TimeDelta,
    pub(crate) min_lead: TimeDelta,
    pub(crate) retry_delay: TimeDelta,
    pub(crate) delivery_timeout: Duration,
    pub(crate) reconciled: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        deliverer: Arc<dyn Deliverer>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            deliverer,
            identity: Arc::new(NoopResolver),
            shared: Arc::new(Shared::new()),
            tolerance: to_delta(config.staleness_tolerance()),
            min_lead: to_delta(config.min_lead()),
            retry_delay: to_delta(config.retry_delay()),
            delivery_timeout: config.delivery_timeout(),
            reconciled: false,
        }
    }

    /// Use a real identity resolver instead of the no-op one.
    /// Affects handles created afterwards.
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_staleness_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = to_delta(tolerance);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = to_delta(delay);
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Mutation API handle; cheap to clone and safe to use from any task.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(
            self.store.clone(),
            self.identity.clone(),
            self.shared.clone(),
            self.min_lead,
        )
    }

    /// Reconcile (if not done yet) and run the loop until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if !self.reconciled {
            self.reconcile().await?;
        }
        tracing::info!(
            "⏰ Scheduler started (store: {}, delivery: {}, staleness tolerance: {}ms)",
            self.store.name(),
            self.deliverer.name(),
            self.tolerance.num_milliseconds()
        );
        self.run_loop(&shutdown).await;
        let dropped = self.shared.clear().await;
        tracing::info!("🛑 Scheduler stopped ({dropped} unfired entries left to the store)");
        Ok(())
    }

    /// Spawn [`run`](Self::run) as a background tokio task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run_loop(&self, shutdown: &CancellationToken) {
        loop {
            let (next, interrupt) = self.shared.pop_and_arm().await;

            let Some(entry) = next else {
                self.shared.set_state(SchedulerState::Idle);
                let kicked = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => false,
                    _ = interrupt.cancelled() => true,
                };
                if kicked {
                    continue;
                } else {
                    break;
                }
            };

            self.shared.set_state(SchedulerState::Waiting {
                id: entry.id,
                at: entry.at,
            });
            let wait = (entry.at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = interrupt.cancelled() => Wake::Interrupted,
                _ = tokio::time::sleep(wait) => Wake::Due,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Interrupted => {
                    tracing::trace!(task_id = entry.id, "wait interrupted, re-evaluating");
                    self.shared.requeue(entry).await;
                    continue;
                }
                Wake::Due => {}
            }

            self.shared
                .set_state(SchedulerState::Dispatching { id: entry.id });
            let outcome = self.dispatch(entry, shutdown).await;
            tracing::debug!(task_id = entry.id, ?outcome, "dispatch finished");
        }
        self.shared.set_state(SchedulerState::Stopped);
    }

    /// Revalidate a popped entry against the store and fire it.
    pub(crate) async fn dispatch(&self, entry: Entry, shutdown: &CancellationToken) -> Dispatch {
        let task = match self.store.get(entry.id).await {
            Ok(Some(task)) if task.is_active => task,
            Ok(_) => {
                tracing::debug!(task_id = entry.id, "reminder cancelled or deleted, dropping entry");
                return Dispatch::Dropped;
            }
            Err(e) => {
                let retry_at = self.defer(entry).await;
                tracing::error!(
                    "❌ Failed to load reminder {} at fire time, retrying at {}: {e}",
                    entry.id,
                    retry_at
                );
                return Dispatch::Deferred;
            }
        };

        if shutdown.is_cancelled() {
            return Dispatch::Aborted;
        }

        if self.is_stale(task.trigger_time, entry.due) {
            tracing::debug!(
                task_id = entry.id,
                popped = %entry.due,
                stored = %task.trigger_time,
                "stale entry, dropping"
            );
            return Dispatch::Stale;
        }

        let fired_at = at_store_precision(Utc::now());
        let notification = Notification::from_task(&task, fired_at);
        let delivery = self.deliver(&task, &notification).await;
        self.complete(entry, &task, fired_at).await;
        Dispatch::Fired(delivery)
    }

    /// Push `entry` back, woken one retry delay from now. Returns the new wake time.
    async fn defer(&self, entry: Entry) -> DateTime<Utc> {
        let retry_at = Utc::now() + self.retry_delay;
        self.shared.requeue(entry.deferred(retry_at)).await;
        retry_at
    }

    fn is_stale(&self, stored: DateTime<Utc>, popped: DateTime<Utc>) -> bool {
        let drift = if stored >= popped {
            stored - popped
        } else {
            popped - stored
        };
        drift > self.tolerance
    }

    /// One bounded delivery attempt.
    async fn attempt(
        &self,
        destination: &str,
        mode: DeliveryMode,
        notification: &Notification,
    ) -> std::result::Result<(), DeliveryError> {
        match tokio::time::timeout(
            self.delivery_timeout,
            self.deliverer.deliver(destination, mode, notification),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Other(format!(
                "{} delivery timed out after {}ms",
                self.deliverer.name(),
                self.delivery_timeout.as_millis()
            ))),
        }
    }

    /// Deliver to the task's destination; on an unreachable direct target,
    /// fall back once to the origin as a broadcast.
    async fn deliver(&self, task: &Task, notification: &Notification) -> Delivery {
        let destination = task.destination();
        let err = match self
            .attempt(destination, task.delivery_mode, notification)
            .await
        {
            Ok(()) => {
                tracing::info!("🔔 Reminder {} delivered to {} ({})", task.id, destination, task.delivery_mode);
                return Delivery::Delivered;
            }
            Err(e) => e,
        };

        let reason = match err {
            DeliveryError::Unreachable(reason) if task.delivery_mode == DeliveryMode::Direct => reason,
            other => {
                tracing::warn!("⚠️ Reminder {} not delivered to {}: {other}", task.id, destination);
                return Delivery::Failed;
            }
        };

        let Some(origin) = task.origin.as_deref() else {
            tracing::warn!(
                "⚠️ Reminder {}: {} unreachable ({reason}) and no fallback destination",
                task.id,
                destination
            );
            return Delivery::Failed;
        };

        tracing::info!(
            "↪️ Reminder {}: {} unreachable ({reason}), falling back to {}",
            task.id,
            destination,
            origin
        );
        match self
            .attempt(origin, DeliveryMode::Broadcast, notification)
            .await
        {
            Ok(()) => Delivery::FellBack,
            Err(e) => {
                tracing::warn!("⚠️ Reminder {} fallback to {} failed: {e}", task.id, origin);
                Delivery::Failed
            }
        }
    }

    /// Completion bookkeeping, run whether or not delivery succeeded.
    async fn complete(&self, entry: Entry, fired: &Task, fired_at: DateTime<Utc>) {
        let _writes = self.shared.write_lock().await;

        // An edit or cancel may have committed while we were delivering.
        let mut task = match self.store.get(fired.id).await {
            Ok(Some(task)) if task.is_active && task.trigger_time == fired.trigger_time => task,
            Ok(_) => {
                tracing::debug!(task_id = fired.id, "reminder changed during delivery, skipping bookkeeping");
                return;
            }
            Err(e) => {
                // Row unknown: retry the whole firing later (may deliver twice).
                let retry_at = self.defer(entry).await;
                tracing::error!(
                    "❌ Failed to reload reminder {} after firing, retrying at {}: {e}",
                    fired.id,
                    retry_at
                );
                return;
            }
        };

        let Some(recurrence) = task.recurrence else {
            match self.store.delete(task.id).await {
                Ok(()) => tracing::debug!(task_id = task.id, "one-shot reminder completed"),
                Err(e) => tracing::error!("❌ Failed to delete fired reminder {}: {e}", task.id),
            }
            return;
        };

        task.last_fired = Some(fired_at);
        match next_occurrence(&recurrence, fired_at) {
            Some(next) => {
                task.trigger_time = next;
                match self.store.update(&task).await {
                    Ok(()) => {
                        self.shared.requeue(Entry::new(task.id, next)).await;
                        tracing::info!("🔁 Reminder {} ({}) re-armed for {}", task.id, recurrence, next);
                    }
                    Err(e) => tracing::error!(
                        "❌ Failed to persist next occurrence of reminder {}; not re-enqueued: {e}",
                        task.id
                    ),
                }
            }
            None => {
                task.is_active = false;
                tracing::error!(
                    "❌ Recurrence '{}' of reminder {} has no next occurrence after {}; deactivating",
                    recurrence,
                    task.id,
                    fired_at
                );
                if let Err(e) = self.store.update(&task).await {
                    tracing::error!("❌ Failed to deactivate reminder {}: {e}", task.id);
                }
            }
        }
    }
}

/// Microseconds: the finest resolution the SQLite store keeps. Index entries
/// must compare equal to what the store returns.
pub(crate) fn at_store_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::test_support::{FlakyStore, RecordingDeliverer, eventually};
    use async_trait::async_trait;
    use chime_core::{NewTask, Payload, Recurrence, TaskEdit, TimeUnit};

    const RECV: Duration = Duration::from_secs(5);

    fn scheduler(store: Arc<dyn TaskStore>, deliverer: RecordingDeliverer) -> Scheduler {
        Scheduler::new(store, Arc::new(deliverer), &SchedulerConfig::default())
    }

    fn in_ms(ms: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::milliseconds(ms)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SchedulerState>, want: SchedulerState) {
        tokio::time::timeout(RECV, rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .expect("scheduler dropped");
    }

    #[tokio::test]
    async fn test_later_created_earlier_task_fires_first() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let a = handle
            .create(NewTask::new("u1", Payload::new("A"), in_ms(1500)))
            .await
            .unwrap();
        let b = handle
            .create(NewTask::new("u1", Payload::new("B"), in_ms(500)))
            .await
            .unwrap();

        let first = tokio::time::timeout(RECV, rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(RECV, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.notification.task_id, b.id);
        assert_eq!(second.notification.task_id, a.id);
        assert!(second.notification.fired_at >= first.notification.fired_at);

        shutdown.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_new_earlier_task_preempts_long_sleep() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let mut states = handle.subscribe();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let far = handle
            .create(NewTask::new("u1", Payload::new("far"), in_ms(60_000)))
            .await
            .unwrap();
        wait_for_state(&mut states, SchedulerState::Waiting { id: far.id, at: far.trigger_time }).await;

        let near = handle
            .create(NewTask::new("u1", Payload::new("near"), in_ms(300)))
            .await
            .unwrap();
        let got = tokio::time::timeout(RECV, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.notification.task_id, near.id);

        // The interrupted entry was pushed back, not lost.
        wait_for_state(&mut states, SchedulerState::Waiting { id: far.id, at: far.trigger_time }).await;
        assert_eq!(handle.pending().await, 0, "far entry is popped and being waited on");

        shutdown.cancel();
        join.await.unwrap().unwrap();
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_hourly_task_rearms_from_fire_time() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let task = handle
            .create(
                NewTask::new("u1", Payload::new("drink water"), in_ms(300))
                    .recurring(Recurrence::Named(TimeUnit::Hour)),
            )
            .await
            .unwrap();

        let got = tokio::time::timeout(RECV, rx.recv()).await.unwrap().unwrap();
        let fired_at = got.notification.fired_at;

        let rearmed = eventually(&*store, task.id, |t| t.is_some_and(|t| t.last_fired.is_some()))
            .await
            .unwrap();
        assert_eq!(rearmed.last_fired, Some(fired_at));
        assert_eq!(rearmed.trigger_time, fired_at + TimeDelta::hours(1));
        assert!(rearmed.is_active);

        let listed = handle.list("u1").await.unwrap();
        assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![task.id]);

        shutdown.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_one_shot_is_deleted_and_second_pop_is_noop() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(NewTask::new("u1", Payload::new("once"), in_ms(200)))
            .await
            .unwrap();
        let entry = Entry::new(task.id, task.trigger_time);

        assert_eq!(sched.dispatch(entry, &token).await, Dispatch::Fired(Delivery::Delivered));
        assert!(store.get(task.id).await.unwrap().is_none());

        assert_eq!(sched.dispatch(entry, &token).await, Dispatch::Dropped);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err(), "fired exactly once");
    }

    #[tokio::test]
    async fn test_edited_time_makes_popped_entry_stale() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(NewTask::new("u1", Payload::new("move me"), in_ms(200)))
            .await
            .unwrap();
        let old = Entry::new(task.id, task.trigger_time);
        handle
            .edit(
                task.id,
                "u1",
                TaskEdit {
                    trigger_time: Some(in_ms(60_000)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(sched.dispatch(old, &token).await, Dispatch::Stale);
        assert!(rx.try_recv().is_err());
        assert!(store.get(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_postponed_task_fires_once_at_new_time() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer).with_staleness_tolerance(Duration::from_millis(200));
        let handle = sched.handle();
        let mut states = handle.subscribe();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let task = handle
            .create(NewTask::new("u1", Payload::new("later"), in_ms(400)))
            .await
            .unwrap();
        wait_for_state(&mut states, SchedulerState::Waiting { id: task.id, at: task.trigger_time }).await;

        let new_time = in_ms(1200);
        handle
            .edit(
                task.id,
                "u1",
                TaskEdit {
                    trigger_time: Some(new_time),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let got = tokio::time::timeout(RECV, rx.recv()).await.unwrap().unwrap();
        assert!(got.notification.fired_at >= new_time - TimeDelta::milliseconds(200));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err(), "old entry must not fire");

        shutdown.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_task_never_fires() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let task = handle
            .create(NewTask::new("u1", Payload::new("nope"), in_ms(300)))
            .await
            .unwrap();
        handle.cancel(task.id, "u1", false).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(800), rx.recv()).await.is_err());
        let kept = store.get(task.id).await.unwrap().unwrap();
        assert!(!kept.is_active, "soft cancel keeps history");

        shutdown.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_direct_falls_back_to_origin() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer.unreachable("dm-closed"));
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(
                NewTask::new("u1", Payload::new("ping"), in_ms(200))
                    .target("dm-closed")
                    .origin("chan-7"),
            )
            .await
            .unwrap();

        let outcome = sched.dispatch(Entry::new(task.id, task.trigger_time), &token).await;
        assert_eq!(outcome, Dispatch::Fired(Delivery::FellBack));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.destination, "chan-7");
        assert_eq!(got.mode, DeliveryMode::Broadcast);
    }

    #[tokio::test]
    async fn test_failed_delivery_still_completes() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, _rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer.unreachable("dm-closed"));
        let handle = sched.handle();
        let token = CancellationToken::new();

        // No origin: nowhere to fall back to, the one-shot is still consumed.
        let once = handle
            .create(NewTask::new("u1", Payload::new("lost"), in_ms(200)).target("dm-closed"))
            .await
            .unwrap();
        let outcome = sched.dispatch(Entry::new(once.id, once.trigger_time), &token).await;
        assert_eq!(outcome, Dispatch::Fired(Delivery::Failed));
        assert!(store.get(once.id).await.unwrap().is_none());

        // A recurring one is still re-armed.
        let daily = handle
            .create(
                NewTask::new("u1", Payload::new("lost daily"), in_ms(200))
                    .target("dm-closed")
                    .recurring(Recurrence::Named(TimeUnit::Day)),
            )
            .await
            .unwrap();
        sched.dispatch(Entry::new(daily.id, daily.trigger_time), &token).await;
        let rearmed = store.get(daily.id).await.unwrap().unwrap();
        assert!(rearmed.trigger_time > daily.trigger_time + TimeDelta::hours(23));
    }

    #[tokio::test]
    async fn test_broken_deliverer_does_not_stall_queue() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, _rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer.broken());
        let handle = sched.handle();
        let mut states = handle.subscribe();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let a = handle.create(NewTask::new("u1", Payload::new("a"), in_ms(200))).await.unwrap();
        let b = handle.create(NewTask::new("u1", Payload::new("b"), in_ms(300))).await.unwrap();

        eventually(&*store, a.id, |t| t.is_none()).await;
        eventually(&*store, b.id, |t| t.is_none()).await;
        wait_for_state(&mut states, SchedulerState::Idle).await;

        shutdown.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unpersisted_next_occurrence_is_not_requeued() {
        let store = Arc::new(FlakyStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(
                NewTask::new("u1", Payload::new("hourly"), in_ms(200))
                    .recurring(Recurrence::Named(TimeUnit::Hour)),
            )
            .await
            .unwrap();
        assert_eq!(handle.pending().await, 1);
        // Simulate the loop having popped it.
        let entry = sched.shared.pop_and_arm().await.0.unwrap();

        store.fail_updates(true);
        assert_eq!(sched.dispatch(entry, &token).await, Dispatch::Fired(Delivery::Delivered));
        assert!(rx.recv().await.is_some());
        assert_eq!(handle.pending().await, 0);

        let unchanged = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.trigger_time, task.trigger_time);
        assert!(unchanged.last_fired.is_none());
    }

    #[tokio::test]
    async fn test_failed_fire_time_read_defers_entry() {
        let store = Arc::new(FlakyStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer).with_retry_delay(Duration::from_millis(100));
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(NewTask::new("u1", Payload::new("retry me"), in_ms(200)))
            .await
            .unwrap();
        let entry = sched.shared.pop_and_arm().await.0.unwrap();

        store.fail_next_gets(1);
        assert_eq!(sched.dispatch(entry, &token).await, Dispatch::Deferred);
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.pending().await, 1, "entry pushed back, not lost");

        let retry = sched.shared.pop_and_arm().await.0.unwrap();
        assert_eq!(retry.id, task.id);
        assert_eq!(retry.due, task.trigger_time, "retry keeps the original due time");
        assert_eq!(sched.dispatch(retry, &token).await, Dispatch::Fired(Delivery::Delivered));
        assert_eq!(rx.recv().await.unwrap().notification.task_id, task.id);
        assert!(store.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loop_delivers_after_transient_store_failure() {
        let store = Arc::new(FlakyStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer).with_retry_delay(Duration::from_millis(100));
        let handle = sched.handle();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        let task = handle
            .create(NewTask::new("u1", Payload::new("still here"), in_ms(200)))
            .await
            .unwrap();
        store.fail_next_gets(1);

        let got = tokio::time::timeout(RECV, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.notification.task_id, task.id);
        eventually(&*store, task.id, |t| t.is_none()).await;

        shutdown.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_edit_during_completion_is_not_overwritten() {
        let store = Arc::new(FlakyStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = Arc::new(scheduler(store.clone(), deliverer));
        let handle = sched.handle();

        let task = handle
            .create(
                NewTask::new("u1", Payload::new("old"), in_ms(200))
                    .recurring(Recurrence::Named(TimeUnit::Hour)),
            )
            .await
            .unwrap();
        let entry = sched.shared.pop_and_arm().await.0.unwrap();

        // Park the completion's write after it has re-read the row.
        store.hold_next_update();
        let firing = tokio::spawn({
            let sched = sched.clone();
            async move { sched.dispatch(entry, &CancellationToken::new()).await }
        });
        tokio::time::timeout(RECV, store.update_held()).await.unwrap();
        assert!(rx.recv().await.is_some());

        let edited_at = in_ms(5 * 60_000);
        let id = task.id;
        let editing = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .edit(
                        id,
                        "u1",
                        TaskEdit {
                            message: Some("new".into()),
                            trigger_time: Some(edited_at),
                            ..Default::default()
                        },
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!editing.is_finished(), "edit waits for the completion write");

        store.release_update();
        assert_eq!(firing.await.unwrap(), Dispatch::Fired(Delivery::Delivered));
        editing.await.unwrap().unwrap();

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.payload.message, "new");
        assert_eq!(stored.trigger_time, at_store_precision(edited_at));
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn test_recurrence_without_next_occurrence_deactivates() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(
                NewTask::new("u1", Payload::new("heat death"), in_ms(200))
                    .recurring(Recurrence::Every { n: u32::MAX, unit: TimeUnit::Year }),
            )
            .await
            .unwrap();
        let entry = sched.shared.pop_and_arm().await.0.unwrap();

        assert_eq!(sched.dispatch(entry, &token).await, Dispatch::Fired(Delivery::Delivered));
        assert!(rx.recv().await.is_some());

        let kept = store.get(task.id).await.unwrap().unwrap();
        assert!(!kept.is_active);
        assert!(kept.last_fired.is_some());
        assert_eq!(handle.pending().await, 0);
    }

    struct HangingDeliverer;

    #[async_trait]
    impl Deliverer for HangingDeliverer {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn deliver(
            &self,
            _destination: &str,
            _mode: DeliveryMode,
            _notification: &Notification,
        ) -> std::result::Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_delivery_times_out_and_completes() {
        let store = Arc::new(MemoryTaskStore::new());
        let sched = Scheduler::new(store.clone(), Arc::new(HangingDeliverer), &SchedulerConfig::default())
            .with_delivery_timeout(Duration::from_millis(100));
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(NewTask::new("u1", Payload::new("void"), in_ms(200)))
            .await
            .unwrap();
        let outcome = tokio::time::timeout(RECV, sched.dispatch(Entry::new(task.id, task.trigger_time), &token))
            .await
            .expect("delivery not bounded");
        assert_eq!(outcome, Dispatch::Fired(Delivery::Failed));
        assert!(store.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_before_firing() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, mut rx) = RecordingDeliverer::new();
        let sched = scheduler(store.clone(), deliverer);
        let handle = sched.handle();
        let token = CancellationToken::new();

        let task = handle
            .create(NewTask::new("u1", Payload::new("late"), in_ms(200)))
            .await
            .unwrap();
        token.cancel();
        let outcome = sched.dispatch(Entry::new(task.id, task.trigger_time), &token).await;
        assert_eq!(outcome, Dispatch::Aborted);
        assert!(rx.try_recv().is_err());
        assert!(store.get(task.id).await.unwrap().is_some(), "nothing persisted after shutdown");
    }

    #[tokio::test]
    async fn test_idle_loop_stops_on_shutdown() {
        let store = Arc::new(MemoryTaskStore::new());
        let (deliverer, _rx) = RecordingDeliverer::new();
        let sched = scheduler(store, deliverer);
        let handle = sched.handle();
        let mut states = handle.subscribe();
        let shutdown = CancellationToken::new();
        let join = sched.spawn(shutdown.clone());

        wait_for_state(&mut states, SchedulerState::Idle).await;
        shutdown.cancel();
        tokio::time::timeout(RECV, join).await.unwrap().unwrap().unwrap();
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_staleness_is_symmetric_within_tolerance() {
        let (deliverer, _rx) = RecordingDeliverer::new();
        let sched = scheduler(Arc::new(MemoryTaskStore::new()), deliverer);
        let t = Utc::now();
        assert!(!sched.is_stale(t, t));
        assert!(!sched.is_stale(t + TimeDelta::seconds(4), t));
        assert!(sched.is_stale(t + TimeDelta::seconds(6), t));
        assert!(sched.is_stale(t - TimeDelta::seconds(6), t));
    }
}
