//! Shared record types for the control plane.
//!
//! These types are the stable contracts between core logic and the persistent
//! store. They must serialize deterministically.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Result of an admission check (trust or budget).
///
/// Denials are expected outcomes, so they are values rather than errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: String,
}

impl Admission {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// One tool invocation captured while an agent worked on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: String,
    #[serde(default)]
    pub project_path: String,
    pub tool_name: String,
    pub input: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Reusable error -> fix knowledge mined from execution history.
///
/// `(project_path, error_pattern_hash)` is unique across the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub project_path: String,
    pub language: String,
    pub error_pattern_hash: String,
    pub error_message: String,
    pub fix_description: String,
    pub fix_diff: String,
    pub confidence: f64,
    pub occurrence_count: u32,
    pub needs_revalidation: bool,
    /// Confidence fell below the decay floor; kept but deprioritized.
    #[serde(default)]
    pub decayed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Error-fix pattern seen often enough to become a documented skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCandidate {
    pub pattern_hash: String,
    pub description: String,
    pub occurrence_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub example_task_ids: BTreeSet<String>,
    pub promoted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceCategory {
    TaskExecution,
    ContainerSetup,
    ErrorResolution,
    Architecture,
    Testing,
    GitWorkflow,
    DependencyMgmt,
}

impl TraceCategory {
    pub const ALL: [TraceCategory; 7] = [
        TraceCategory::TaskExecution,
        TraceCategory::ContainerSetup,
        TraceCategory::ErrorResolution,
        TraceCategory::Architecture,
        TraceCategory::Testing,
        TraceCategory::GitWorkflow,
        TraceCategory::DependencyMgmt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TraceCategory::TaskExecution => "task_execution",
            TraceCategory::ContainerSetup => "container_setup",
            TraceCategory::ErrorResolution => "error_resolution",
            TraceCategory::Architecture => "architecture",
            TraceCategory::Testing => "testing",
            TraceCategory::GitWorkflow => "git_workflow",
            TraceCategory::DependencyMgmt => "dependency_mgmt",
        }
    }
}

impl fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Pending,
    Success,
    Failure,
    Partial,
}

impl TraceOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceOutcome::Pending => "pending",
            TraceOutcome::Success => "success",
            TraceOutcome::Failure => "failure",
            TraceOutcome::Partial => "partial",
        }
    }
}

/// A recorded decision whose outcome is filled in once the action concludes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub id: String,
    pub category: TraceCategory,
    pub description: String,
    pub decision: String,
    pub outcome: TraceOutcome,
    pub context: serde_json::Value,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable cost ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub cost_usd: f64,
    pub turns: u32,
    pub task: String,
}
