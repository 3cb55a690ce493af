//! # Chime Core
//!
//! Shared types for the reminder scheduler: the task model, the recurrence
//! variant, configuration, errors, and the traits the scheduler consumes
//! (task store, delivery mechanism, identity resolver).

pub mod config;
pub mod error;
pub mod notification;
pub mod recurrence;
pub mod task;
pub mod traits;

pub use config::ChimeConfig;
pub use error::{ChimeError, DeliveryError, Result};
pub use notification::Notification;
pub use recurrence::{Recurrence, TimeUnit};
pub use task::{DeliveryMode, NewTask, Payload, Task, TaskEdit, TaskId};
