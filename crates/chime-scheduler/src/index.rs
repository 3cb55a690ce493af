//! Schedule index: in-memory min-heap of `(trigger_time, task_id)`.
//!
//! Carries ids only, never payloads. Entries may be stale (task cancelled,
//! edited, or already fired); the loop revalidates against the store when it
//! pops, so there is no remove-by-id.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use chime_core::TaskId;

/// One scheduled wake-up. Ordered by wake time, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry {
    /// When the loop should wake for this entry.
    pub at: DateTime<Utc>,
    pub id: TaskId,
    /// The trigger time this entry stands for. Equal to `at` unless the
    /// entry was deferred by a retry.
    pub due: DateTime<Utc>,
}

impl Entry {
    pub fn new(id: TaskId, at: DateTime<Utc>) -> Self {
        Self { at, id, due: at }
    }

    /// Same task and trigger time, woken later.
    pub fn deferred(self, at: DateTime<Utc>) -> Self {
        Self { at, ..self }
    }
}

#[derive(Debug, Default)]
pub struct ScheduleIndex {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl ScheduleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: TaskId, at: DateTime<Utc>) {
        self.heap.push(Reverse(Entry::new(id, at)));
    }

    pub fn push_entry(&mut self, entry: Entry) {
        self.heap.push(Reverse(entry));
    }

    /// Remove and return the soonest entry.
    pub fn pop_min(&mut self) -> Option<Entry> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    pub fn peek_min(&self) -> Option<&Entry> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
