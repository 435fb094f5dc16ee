//! Feature Manager: the persisted feature set of one project.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::core::features::{
    Feature, FeatureStatus, GraphError, GraphValidationError, check_transition, next_ready,
    validate_graph,
};
use crate::core::plan::PlanDocument;
use crate::io::project_state::{ProjectPaths, load_features, write_features};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub implemented: usize,
    pub blocked: usize,
    pub tested: usize,
}

impl FeatureSummary {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.implemented + self.blocked + self.tested
    }
}

/// Every mutation is written to `<project>/.autopilot/features.json` before returning.
#[derive(Debug)]
pub struct FeatureManager {
    paths: ProjectPaths,
    features: Vec<Feature>,
}

impl FeatureManager {
    /// Load the project's feature set, or start empty.
    pub fn open(project_root: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(project_root);
        let features = load_features(&paths.features_path)?.unwrap_or_default();
        debug!(project = %project_root.display(), count = features.len(), "feature set loaded");
        Ok(Self { paths, features })
    }

    /// Replace the feature set with the plan's subtasks after validating the graph.
    ///
    /// Graph violations surface as [`GraphValidationError`] and leave the
    /// current set untouched.
    pub fn load_from_plan(&mut self, plan: &PlanDocument) -> Result<()> {
        let features = plan.to_features();
        let errors = validate_graph(&features);
        if !errors.is_empty() {
            return Err(GraphValidationError(errors).into());
        }
        info!(count = features.len(), "feature set loaded from plan");
        self.features = features;
        self.save()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn get_next_pending(&self) -> Option<&Feature> {
        next_ready(&self.features)
    }

    pub fn validate_graph(&self) -> Vec<GraphError> {
        validate_graph(&self.features)
    }

    /// Apply a status edge from the transition table.
    ///
    /// Illegal edges fail with [`crate::core::features::TransitionError`].
    pub fn mark_status(&mut self, id: &str, status: FeatureStatus) -> Result<()> {
        let feature = self.feature_mut(id)?;
        check_transition(id, feature.status, status)?;
        debug!(feature = id, from = %feature.status, to = %status, "feature status changed");
        feature.status = status;
        self.save()
    }

    /// Returns the new attempt count.
    pub fn increment_attempts(&mut self, id: &str) -> Result<u32> {
        let feature = self.feature_mut(id)?;
        feature.attempts += 1;
        let attempts = feature.attempts;
        self.save()?;
        Ok(attempts)
    }

    pub fn reset_attempts(&mut self, id: &str) -> Result<()> {
        self.feature_mut(id)?.attempts = 0;
        self.save()
    }

    pub fn record_cost(&mut self, id: &str, cost_usd: f64) -> Result<()> {
        if !cost_usd.is_finite() || cost_usd < 0.0 {
            return Err(anyhow!("cost must be a non-negative amount, got {cost_usd}"));
        }
        self.feature_mut(id)?.cost_usd += cost_usd;
        self.save()
    }

    pub fn features_in(&self, status: FeatureStatus) -> Vec<&Feature> {
        self.features.iter().filter(|f| f.status == status).collect()
    }

    pub fn summary(&self) -> FeatureSummary {
        let mut summary = FeatureSummary::default();
        for feature in &self.features {
            let slot = match feature.status {
                FeatureStatus::Pending => &mut summary.pending,
                FeatureStatus::InProgress => &mut summary.in_progress,
                FeatureStatus::Implemented => &mut summary.implemented,
                FeatureStatus::Blocked => &mut summary.blocked,
                FeatureStatus::Tested => &mut summary.tested,
            };
            *slot += 1;
        }
        summary
    }

    pub fn save(&self) -> Result<()> {
        write_features(&self.paths.features_path, &self.features)
    }

    fn feature_mut(&mut self, id: &str) -> Result<&mut Feature> {
        self.features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| anyhow!("unknown feature '{id}'"))
    }
}
