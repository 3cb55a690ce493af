//! Error types for Chime.

use crate::task::TaskId;

/// Top-level error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum ChimeError {
    /// Trigger time is not strictly in the future.
    #[error("trigger time must be in the future")]
    InvalidTime,

    /// Recurrence spec could not be parsed.
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),

    /// No (active) task with this id.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Caller does not own the task.
    #[error("task {0} is owned by someone else")]
    NotOwner(TaskId),

    /// Persistence gateway failure.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Identity resolution failure.
    #[error("identity error: {0}")]
    Identity(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChimeError {
    /// Validation errors are the caller's fault and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChimeError::InvalidTime
                | ChimeError::InvalidRecurrence(_)
                | ChimeError::NotFound(_)
                | ChimeError::NotOwner(_)
        )
    }
}

/// Delivery failure reported by a [`Deliverer`](crate::traits::delivery::Deliverer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The destination cannot be reached (blocked DMs, deleted channel, ...).
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    /// Any other failure; terminal for the firing.
    #[error("delivery failed: {0}")]
    Other(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChimeError>;
