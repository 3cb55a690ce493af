//! Startup reconciliation: seed the schedule index from persisted tasks.

use chrono::{DateTime, Utc};

use chime_core::Result;
use chime_core::traits::TaskStore;

use crate::engine::{Scheduler, Shared};
use crate::index::Entry;

/// Push every active, future task into the index. Overdue tasks are left
/// in the store untouched.
pub(crate) async fn seed_from_store(
    store: &dyn TaskStore,
    shared: &Shared,
    now: DateTime<Utc>,
) -> Result<usize> {
    let tasks = store.load_active_future(now).await?;
    let entries = tasks
        .iter()
        .filter(|t| t.is_active && t.trigger_time > now)
        .map(|t| Entry::new(t.id, t.trigger_time));
    let (seeded, next) = shared.seed(entries).await;
    match next {
        Some(next) => tracing::info!(
            "📅 Reconciled {} reminder(s) from {} store, next due {}",
            seeded,
            store.name(),
            next.at
        ),
        None => tracing::info!("📅 Reconciled {} reminder(s) from {} store", seeded, store.name()),
    }
    Ok(seeded)
}

impl Scheduler {
    /// Rebuild the index from the store. Called by `run` if not done
    /// explicitly; a store failure here aborts startup.
    pub async fn reconcile(&mut self) -> Result<usize> {
        let seeded = seed_from_store(&*self.store, &self.shared, Utc::now()).await?;
        self.reconciled = true;
        Ok(seeded)
    }
}
