//! Model Router: triage a task, then pick the cheapest adequate tier.
//!
//! Local collaborators are optional. When absent, unavailable or failing,
//! triage falls back to keyword heuristics instead of erroring.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::triage::{Complexity, heuristic_complexity, is_classification_task};
use crate::io::config::RouterConfig;

const BASE_TOKENS: u64 = 2_000;
const TOKENS_PER_FILE: u64 = 1_500;

/// On-device model that can classify and narrow work.
pub trait LocalInference: Send + Sync {
    fn is_available(&self) -> bool;
    fn classify_task_complexity(&self, text: &str) -> Result<Complexity>;
    fn filter_relevant_files(&self, text: &str, files: &[String]) -> Result<Vec<String>>;
}

/// Zero-cost on-device classifier for labeling tasks.
pub trait FastClassifier: Send + Sync {
    fn is_available(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    OnDevice,
    Local,
    Cloud,
    Unavailable,
}

impl RouteTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteTier::OnDevice => "on_device",
            RouteTier::Local => "local",
            RouteTier::Cloud => "cloud",
            RouteTier::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for RouteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageSource {
    LocalModel,
    Heuristic,
    /// Classification keywords matched; no complexity triage ran.
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriageResult {
    pub complexity: Complexity,
    /// Narrowed candidate files; `None` when no narrowing happened.
    pub filtered_files: Option<Vec<String>>,
    pub source: TriageSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub tier: RouteTier,
    pub model: Option<String>,
    pub justification: String,
    pub filtered_files: Option<Vec<String>>,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    pub triage: TriageResult,
}

pub struct ModelRouter {
    config: RouterConfig,
    local: Option<Arc<dyn LocalInference>>,
    classifier: Option<Arc<dyn FastClassifier>>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            local: None,
            classifier: None,
        }
    }

    pub fn with_local(mut self, local: Arc<dyn LocalInference>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FastClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    fn available_local(&self) -> Option<&dyn LocalInference> {
        self.local.as_deref().filter(|local| local.is_available())
    }

    fn classifier_available(&self) -> bool {
        self.classifier.as_deref().is_some_and(|c| c.is_available())
    }

    pub fn triage(&self, task: &str, files: &[String]) -> TriageResult {
        if let Some(local) = self.available_local() {
            match local.classify_task_complexity(task) {
                Ok(complexity) => {
                    let filtered_files = match local.filter_relevant_files(task, files) {
                        Ok(subset) => Some(subset),
                        Err(err) => {
                            warn!(err = %err, "local file filter failed, keeping all files");
                            None
                        }
                    };
                    return TriageResult {
                        complexity,
                        filtered_files,
                        source: TriageSource::LocalModel,
                    };
                }
                Err(err) => warn!(err = %err, "local triage failed, using heuristics"),
            }
        }
        TriageResult {
            complexity: heuristic_complexity(task, files.len()),
            filtered_files: None,
            source: TriageSource::Heuristic,
        }
    }

    pub fn route(
        &self,
        task: &str,
        files: &[String],
        budget_remaining_usd: f64,
        offline: bool,
    ) -> RoutingDecision {
        if is_classification_task(task) && self.classifier_available() {
            let triage = TriageResult {
                complexity: Complexity::Trivial,
                filtered_files: None,
                source: TriageSource::Keyword,
            };
            return self.decide(
                RouteTier::OnDevice,
                "classification task handled by the on-device classifier at no cost".to_string(),
                0,
                triage,
            );
        }

        let triage = self.triage(task, files);
        let scoped_files = triage.filtered_files.as_ref().map_or(files.len(), Vec::len);
        let tokens = estimate_tokens(scoped_files);
        let local_available = self.available_local().is_some();

        let decision = if triage.complexity.is_lightweight() && local_available {
            self.decide(
                RouteTier::Local,
                format!("{} task fits the local model", triage.complexity),
                tokens,
                triage,
            )
        } else if offline && !local_available {
            self.decide(
                RouteTier::Unavailable,
                "offline mode is forced and no local model is available".to_string(),
                0,
                triage,
            )
        } else if offline {
            self.decide(
                RouteTier::Local,
                format!(
                    "offline mode is forced; {} task stays on the local model",
                    triage.complexity
                ),
                tokens,
                triage,
            )
        } else {
            let cost = cost_for(tokens, self.config.cloud_usd_per_1k_tokens);
            let mut justification = format!(
                "{} task routed to the cloud model over {scoped_files} file(s)",
                triage.complexity
            );
            if cost > budget_remaining_usd {
                justification.push_str(&format!(
                    "; estimated ${cost:.4} exceeds remaining budget ${budget_remaining_usd:.4}"
                ));
            }
            self.decide(RouteTier::Cloud, justification, tokens, triage)
        };
        debug!(
            tier = %decision.tier,
            complexity = %decision.triage.complexity,
            tokens = decision.estimated_tokens,
            "task routed"
        );
        decision
    }

    fn decide(
        &self,
        tier: RouteTier,
        justification: String,
        estimated_tokens: u64,
        triage: TriageResult,
    ) -> RoutingDecision {
        let (model, price) = match tier {
            RouteTier::OnDevice => (Some(self.config.classifier_model.clone()), 0.0),
            RouteTier::Local => (
                Some(self.config.local_model.clone()),
                self.config.local_usd_per_1k_tokens,
            ),
            RouteTier::Cloud => (
                Some(self.config.cloud_model.clone()),
                self.config.cloud_usd_per_1k_tokens,
            ),
            RouteTier::Unavailable => (None, 0.0),
        };
        RoutingDecision {
            tier,
            model,
            justification,
            filtered_files: triage.filtered_files.clone(),
            estimated_tokens,
            estimated_cost_usd: cost_for(estimated_tokens, price),
            triage,
        }
    }
}

pub fn estimate_tokens(file_count: usize) -> u64 {
    BASE_TOKENS + TOKENS_PER_FILE * file_count as u64
}

fn cost_for(tokens: u64, usd_per_1k: f64) -> f64 {
    tokens as f64 / 1_000.0 * usd_per_1k
}
