//! Rendered notification handed to the delivery mechanism.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskId};

/// What a deliverer sends. Built from a task at fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: TaskId,
    pub owner: String,
    pub title: String,
    pub body: String,
    pub fired_at: DateTime<Utc>,
}

impl Notification {
    pub fn from_task(task: &Task, fired_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            owner: task.owner.clone(),
            title: task
                .payload
                .title
                .clone()
                .unwrap_or_else(|| "Reminder".to_string()),
            body: task.payload.message.clone(),
            fired_at,
        }
    }
}
