//! Activity states and due-task selection for the idle processor.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    Idle,
    Hibernated,
}

impl ActivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityState::Active => "active",
            ActivityState::Idle => "idle",
            ActivityState::Hibernated => "hibernated",
        }
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Background task priority; `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Scheduling metadata for one registered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSlot {
    pub name: String,
    pub priority: Priority,
    pub interval: Duration,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TaskSlot {
    pub fn new(name: impl Into<String>, priority: Priority, interval: Duration) -> Self {
        Self {
            name: name.into(),
            priority,
            interval,
            last_run: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().is_ok_and(|elapsed| elapsed >= self.interval)
            }
        }
    }
}

/// Indices of due slots, highest priority first, registration order within a priority.
pub fn due_in_priority_order(slots: &[TaskSlot], now: DateTime<Utc>) -> Vec<usize> {
    let mut due: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_due(now))
        .map(|(idx, _)| idx)
        .collect();
    due.sort_by_key(|&idx| (slots[idx].priority, idx));
    due
}
