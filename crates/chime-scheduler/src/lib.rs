//! # Chime Scheduler
//!
//! Persistent reminder scheduler: one loop, one min-heap of wake-ups, and a
//! store that is the source of truth.
//!
//! ## Design Principles
//! - The index carries ids only; every pop is revalidated against the store
//! - Mutations commit to the store first, then push + kick the loop
//! - Stale entries are dropped, never removed eagerly
//! - Tokio timers only, zero overhead when idle
//!
//! ## Architecture
//! ```text
//! SchedulerHandle ── create / edit / cancel ──▶ TaskStore (SQLite | memory)
//!        │                                          ▲
//!        └── push(id, at) + kick ──▶ ScheduleIndex  │ get / update / delete
//!                                        │          │
//!                                Scheduler loop ────┘
//!                                        └── fire ──▶ Deliverer (webhook | log)
//! ```

pub mod dispatch;
pub mod engine;
pub mod gate;
pub mod handle;
pub mod index;
pub mod persistence;
pub mod reconcile;
pub mod recurrence;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatch::{LogDeliverer, WebhookDeliverer, deliverer_from_config};
pub use engine::{Scheduler, SchedulerState};
pub use handle::SchedulerHandle;
pub use index::{Entry, ScheduleIndex};
pub use persistence::SqliteTaskStore;
pub use recurrence::{next_from_spec, next_occurrence};
pub use store::MemoryTaskStore;
