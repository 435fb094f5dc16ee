//! Trust Engine: per-project tier bookkeeping over the persistent store.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::trust::{
    Action, MAX_TIER, TierChange, TrustPolicy, TrustScore, evaluate_action, tier_label,
};
use crate::core::types::Admission;
use crate::io::store::MemoryStore;

/// Read-only view of a project's trust position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustStatus {
    pub score: TrustScore,
    pub label: &'static str,
    /// `None` at the top tier.
    pub successes_to_promotion: Option<u32>,
}

pub struct TrustEngine {
    store: Arc<MemoryStore>,
    policy: TrustPolicy,
}

impl TrustEngine {
    pub fn new(store: Arc<MemoryStore>, policy: TrustPolicy) -> Self {
        Self { store, policy }
    }

    /// Stored score, or a fresh tier-0 score for unknown projects.
    pub fn score(&self, project: &str) -> Result<TrustScore> {
        Ok(self
            .store
            .trust(project)?
            .unwrap_or_else(|| TrustScore::new(project)))
    }

    pub fn can_perform(&self, project: &str, action: Action) -> Result<Admission> {
        let score = self.score(project)?;
        let admission = evaluate_action(score.tier, action);
        if !admission.allowed {
            debug!(
                project,
                action = %action,
                tier = score.tier,
                reason = %admission.reason,
                "action denied"
            );
        }
        Ok(admission)
    }

    /// Returns an upgrade message when the streak promotes the project.
    pub fn record_success(&self, project: &str) -> Result<Option<String>> {
        let change = self
            .store
            .update_trust(project, |score| Ok(score.record_success(&self.policy)))?;
        Ok(change.map(|change| {
            info!(project, from = change.from, to = change.to, "trust tier promoted");
            format!(
                "Trust upgraded for {project}: {} after {} consecutive successes",
                describe(change),
                self.policy.promotion_streak
            )
        }))
    }

    pub fn record_failure(&self, project: &str) -> Result<()> {
        self.store.update_trust(project, |score| {
            score.record_failure();
            Ok(())
        })
    }

    /// Returns a downgrade message when the rollback demotes the project.
    pub fn record_rollback(&self, project: &str) -> Result<Option<String>> {
        let (change, rollbacks) = self.store.update_trust(project, |score| {
            let change = score.record_rollback(&self.policy, Utc::now());
            Ok((change, score.rollbacks))
        })?;
        Ok(change.map(|change| {
            warn!(project, from = change.from, to = change.to, rollbacks, "trust tier demoted");
            format!(
                "Trust downgraded for {project}: {} after {rollbacks} rollbacks",
                describe(change)
            )
        }))
    }

    pub fn set_tier(&self, project: &str, tier: u8) -> Result<()> {
        self.store.update_trust(project, |score| score.set_tier(tier))?;
        info!(project, tier, "trust tier set manually");
        Ok(())
    }

    pub fn status(&self, project: &str) -> Result<TrustStatus> {
        let score = self.score(project)?;
        let successes_to_promotion = (score.tier < MAX_TIER).then(|| {
            self.policy
                .promotion_streak
                .saturating_sub(score.consecutive_successes)
        });
        Ok(TrustStatus {
            label: tier_label(score.tier),
            successes_to_promotion,
            score,
        })
    }
}

fn describe(change: TierChange) -> String {
    format!(
        "T{} ({}) -> T{} ({})",
        change.from,
        tier_label(change.from),
        change.to,
        tier_label(change.to)
    )
}
