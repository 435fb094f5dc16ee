//! Graduated-autonomy policy.
//!
//! A project's trust tier (0..=4) gates which actions an agent may take
//! without a human. Tiers move up after a streak of successful tasks and down
//! after repeated rollbacks.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Admission;

pub const MIN_TIER: u8 = 0;
pub const MAX_TIER: u8 = 4;

/// Actions gated by the trust tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ReadFile,
    SearchCode,
    ListFiles,
    EditFile,
    WriteFile,
    RunTests,
    GitCommit,
    InstallDependency,
    ContainerCreate,
    ContainerExec,
    GitPush,
    CreatePullRequest,
    RunCommand,
    MergePullRequest,
    DeleteBranch,
    DeployProduction,
    ModifyCiCd,
    DeleteMainBranch,
}

const ALL_ACTIONS: [Action; 18] = [
    Action::ReadFile,
    Action::SearchCode,
    Action::ListFiles,
    Action::EditFile,
    Action::WriteFile,
    Action::RunTests,
    Action::GitCommit,
    Action::InstallDependency,
    Action::ContainerCreate,
    Action::ContainerExec,
    Action::GitPush,
    Action::CreatePullRequest,
    Action::RunCommand,
    Action::MergePullRequest,
    Action::DeleteBranch,
    Action::DeployProduction,
    Action::ModifyCiCd,
    Action::DeleteMainBranch,
];

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ReadFile => "read_file",
            Action::SearchCode => "search_code",
            Action::ListFiles => "list_files",
            Action::EditFile => "edit_file",
            Action::WriteFile => "write_file",
            Action::RunTests => "run_tests",
            Action::GitCommit => "git_commit",
            Action::InstallDependency => "install_dependency",
            Action::ContainerCreate => "container_create",
            Action::ContainerExec => "container_exec",
            Action::GitPush => "git_push",
            Action::CreatePullRequest => "create_pull_request",
            Action::RunCommand => "run_command",
            Action::MergePullRequest => "merge_pull_request",
            Action::DeleteBranch => "delete_branch",
            Action::DeployProduction => "deploy_production",
            Action::ModifyCiCd => "modify_ci_cd",
            Action::DeleteMainBranch => "delete_main_branch",
        }
    }

    /// Minimum tier at which the action is auto-approved.
    pub fn required_tier(self) -> u8 {
        match self {
            Action::ReadFile | Action::SearchCode | Action::ListFiles => 0,
            Action::EditFile | Action::WriteFile | Action::RunTests => 1,
            Action::GitCommit
            | Action::InstallDependency
            | Action::ContainerCreate
            | Action::ContainerExec => 2,
            Action::GitPush | Action::CreatePullRequest | Action::RunCommand => 3,
            Action::MergePullRequest
            | Action::DeleteBranch
            | Action::DeployProduction
            | Action::ModifyCiCd
            | Action::DeleteMainBranch => 4,
        }
    }

    /// Actions that always need a human, regardless of tier.
    pub fn always_requires_approval(self) -> bool {
        matches!(
            self,
            Action::DeployProduction | Action::ModifyCiCd | Action::DeleteMainBranch
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_ACTIONS
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| anyhow!("unknown action '{s}'"))
    }
}

pub fn tier_label(tier: u8) -> &'static str {
    match tier {
        0 => "observe",
        1 => "edit",
        2 => "build",
        3 => "publish",
        _ => "autonomous",
    }
}

/// Thresholds for tier movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    /// Consecutive successes needed to promote one tier.
    pub promotion_streak: u32,
    /// Cumulative rollbacks at which each further rollback demotes one tier.
    pub demotion_rollbacks: u32,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            promotion_streak: 10,
            demotion_rollbacks: 2,
        }
    }
}

/// Persisted trust state for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustScore {
    pub project_path: String,
    pub tier: u8,
    pub successful_tasks: u32,
    pub total_tasks: u32,
    pub rollbacks: u32,
    pub consecutive_successes: u32,
    pub last_rollback_time: Option<DateTime<Utc>>,
}

/// A tier movement caused by a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChange {
    pub from: u8,
    pub to: u8,
}

impl TrustScore {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            tier: MIN_TIER,
            successful_tasks: 0,
            total_tasks: 0,
            rollbacks: 0,
            consecutive_successes: 0,
            last_rollback_time: None,
        }
    }

    pub fn record_success(&mut self, policy: &TrustPolicy) -> Option<TierChange> {
        self.total_tasks += 1;
        self.successful_tasks += 1;
        self.consecutive_successes += 1;
        if self.consecutive_successes < policy.promotion_streak || self.tier >= MAX_TIER {
            return None;
        }
        let from = self.tier;
        self.tier += 1;
        self.consecutive_successes = 0;
        Some(TierChange { from, to: self.tier })
    }

    pub fn record_failure(&mut self) {
        self.total_tasks += 1;
        self.consecutive_successes = 0;
    }

    /// Count a rollback; demotes once the cumulative count reaches the policy threshold.
    ///
    /// The count is never reset, so every rollback past the threshold demotes again.
    pub fn record_rollback(
        &mut self,
        policy: &TrustPolicy,
        now: DateTime<Utc>,
    ) -> Option<TierChange> {
        self.rollbacks += 1;
        self.consecutive_successes = 0;
        self.last_rollback_time = Some(now);
        if self.rollbacks < policy.demotion_rollbacks || self.tier == MIN_TIER {
            return None;
        }
        let from = self.tier;
        self.tier -= 1;
        Some(TierChange { from, to: self.tier })
    }

    pub fn set_tier(&mut self, tier: u8) -> Result<()> {
        if tier > MAX_TIER {
            return Err(anyhow!("tier {tier} out of range {MIN_TIER}..={MAX_TIER}"));
        }
        self.tier = tier;
        self.consecutive_successes = 0;
        Ok(())
    }
}

/// Decide whether `action` is auto-approved at `tier`.
pub fn evaluate_action(tier: u8, action: Action) -> Admission {
    if action.always_requires_approval() {
        return Admission::deny(format!("{action} always requires human approval"));
    }
    let required = action.required_tier();
    if tier >= required {
        Admission::allow(format!(
            "{action} allowed at T{tier} ({}), requires T{required}",
            tier_label(tier)
        ))
    } else {
        Admission::deny(format!(
            "{action} requires T{required} ({}), project is at T{tier} ({})",
            tier_label(required),
            tier_label(tier)
        ))
    }
}
