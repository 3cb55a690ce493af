//! Task definitions: the core data model for scheduled reminders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recurrence::Recurrence;

/// Store-assigned task identifier; the only thing the schedule index carries.
pub type TaskId = i64;

/// Where a fired task is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Straight to the task's target.
    #[default]
    Direct,
    /// To the shared destination the task was created from.
    Broadcast,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Direct => "direct",
            DeliveryMode::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(DeliveryMode::Direct),
            "broadcast" => Some(DeliveryMode::Broadcast),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque message content. The scheduler never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Payload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A scheduled reminder as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned id (0 until inserted).
    pub id: TaskId,
    /// Who created the task.
    pub owner: String,
    /// Delivery destination for direct mode.
    pub target: String,
    /// Shared destination the task was created from (broadcast / fallback).
    pub origin: Option<String>,
    pub payload: Payload,
    /// When the task becomes due.
    pub trigger_time: DateTime<Utc>,
    /// `None` = one-shot.
    pub recurrence: Option<Recurrence>,
    pub last_fired: Option<DateTime<Utc>>,
    /// `false` = cancelled but kept for history.
    pub is_active: bool,
    pub delivery_mode: DeliveryMode,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Where this task should be delivered given its mode.
    /// Broadcast without an origin falls back to the target.
    pub fn destination(&self) -> &str {
        match self.delivery_mode {
            DeliveryMode::Direct => &self.target,
            DeliveryMode::Broadcast => self.origin.as_deref().unwrap_or(&self.target),
        }
    }
}

/// Input to `create`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub owner: String,
    pub target: String,
    pub origin: Option<String>,
    pub payload: Payload,
    pub trigger_time: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
    pub delivery_mode: DeliveryMode,
}

impl NewTask {
    /// One-shot direct reminder to oneself.
    pub fn new(owner: impl Into<String>, payload: Payload, trigger_time: DateTime<Utc>) -> Self {
        let owner = owner.into();
        Self {
            target: owner.clone(),
            owner,
            origin: None,
            payload,
            trigger_time,
            recurrence: None,
            delivery_mode: DeliveryMode::Direct,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn recurring(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    /// Set recurrence from its textual form ("daily", "every 3 weeks", "none").
    pub fn recurrence_spec(mut self, spec: &str) -> crate::Result<Self> {
        self.recurrence = Recurrence::parse(spec)?;
        Ok(self)
    }

    pub fn mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Build the unsaved row; the store assigns the id.
    pub fn into_task(self, created_at: DateTime<Utc>) -> Task {
        Task {
            id: 0,
            owner: self.owner,
            target: self.target,
            origin: self.origin,
            payload: self.payload,
            trigger_time: self.trigger_time,
            recurrence: self.recurrence,
            last_fired: None,
            is_active: true,
            delivery_mode: self.delivery_mode,
            created_at,
        }
    }
}

/// Partial update for `edit`. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskEdit {
    pub target: Option<String>,
    pub message: Option<String>,
    /// `Some(None)` clears the title.
    pub title: Option<Option<String>>,
    pub trigger_time: Option<DateTime<Utc>>,
    /// `Some(None)` makes the task one-shot.
    pub recurrence: Option<Option<Recurrence>>,
    pub delivery_mode: Option<DeliveryMode>,
}

impl TaskEdit {
    pub fn is_empty(&self) -> bool {
        *self == TaskEdit::default()
    }
}
