//! Repetition and stagnation detection for one subtask.
//!
//! Repeated identical errors mean the approach is wrong; repeated identical
//! output without errors means silent stagnation. The two trigger different
//! interventions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::hashing::truncated_hash;

/// Intervention requested after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    Continue,
    Warn,
    ChangeApproach,
    Escalate,
    HardStop,
}

impl LoopAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopAction::Continue => "continue",
            LoopAction::Warn => "warn",
            LoopAction::ChangeApproach => "change_approach",
            LoopAction::Escalate => "escalate",
            LoopAction::HardStop => "hard_stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRecord {
    pub tool_name: String,
    pub input_hash: String,
    pub output_hash: String,
    pub error: Option<String>,
    pub error_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IterationRecord {
    pub fn new(tool_name: &str, input: &str, output: &str, error: Option<&str>) -> Self {
        let error = error.map(str::trim).filter(|e| !e.is_empty());
        Self {
            tool_name: tool_name.to_string(),
            input_hash: truncated_hash(input),
            output_hash: truncated_hash(output),
            error: error.map(str::to_string),
            error_hash: error.map(truncated_hash),
            timestamp: Utc::now(),
        }
    }
}

/// Action plus the intervention message shown to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopVerdict {
    pub action: LoopAction,
    pub message: Option<String>,
}

impl LoopVerdict {
    fn proceed() -> Self {
        Self {
            action: LoopAction::Continue,
            message: None,
        }
    }

    fn intervene(action: LoopAction, message: String) -> Self {
        Self {
            action,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopLimits {
    pub max_iterations: u32,
    /// Number of trailing records compared for repetition.
    pub repeat_window: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            repeat_window: 3,
        }
    }
}

/// Iteration history for one subtask.
#[derive(Debug, Clone, Default)]
pub struct SubtaskTracker {
    pub records: Vec<IterationRecord>,
    pub warned: bool,
}

impl SubtaskTracker {
    /// Append `record` and evaluate the triggers in priority order.
    pub fn record(&mut self, record: IterationRecord, limits: &LoopLimits) -> LoopVerdict {
        self.records.push(record);
        let count = self.records.len() as u32;
        let max = limits.max_iterations;

        if count >= max {
            return LoopVerdict::intervene(
                LoopAction::HardStop,
                format!(
                    "Iteration limit reached ({count}/{max}). \
                     Stop and report what is blocking progress."
                ),
            );
        }
        if let Some(error) = self.repeated_error(limits.repeat_window) {
            return LoopVerdict::intervene(
                LoopAction::ChangeApproach,
                format!(
                    "The same error occurred {} times in a row: {}. \
                     The current fix is not working; try a different approach.",
                    limits.repeat_window, error
                ),
            );
        }
        if self.repeated_output(limits.repeat_window) {
            return LoopVerdict::intervene(
                LoopAction::Escalate,
                format!(
                    "The last {} tool calls produced identical output with no error. \
                     Progress has stalled; escalate to a human.",
                    limits.repeat_window
                ),
            );
        }
        if count * 5 >= max * 4 {
            return LoopVerdict::intervene(
                LoopAction::ChangeApproach,
                format!(
                    "{count} of {max} iterations used. \
                     Reconsider the approach before the limit is reached."
                ),
            );
        }
        if count * 2 >= max && !self.warned {
            self.warned = true;
            return LoopVerdict::intervene(
                LoopAction::Warn,
                format!("{count} of {max} iterations used. Make sure each step makes progress."),
            );
        }
        LoopVerdict::proceed()
    }

    fn tail(&self, window: usize) -> Option<&[IterationRecord]> {
        if window == 0 || self.records.len() < window {
            return None;
        }
        Some(&self.records[self.records.len() - window..])
    }

    fn repeated_error(&self, window: usize) -> Option<&str> {
        let tail = self.tail(window)?;
        let first = tail[0].error_hash.as_ref()?;
        if tail
            .iter()
            .all(|r| r.error_hash.as_ref() == Some(first))
        {
            return tail[0].error.as_deref();
        }
        None
    }

    fn repeated_output(&self, window: usize) -> bool {
        let Some(tail) = self.tail(window) else {
            return false;
        };
        tail.iter().all(|r| r.output_hash == tail[0].output_hash)
    }
}
