//! Default background tasks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::budget::daily_breakdown;
use crate::core::hashing::hash_error_pattern;
use crate::core::schedule::Priority;
use crate::core::types::{Learning, TraceCategory, TraceOutcome};
use crate::idle::BackgroundTask;
use crate::io::config::{IdleConfig, LearningConfig};
use crate::io::store::MemoryStore;
use crate::learning::{SHARED_PROJECT, SelfLearning};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Confidence of cold-start heuristics; below a freshly observed learning.
const SEED_CONFIDENCE: f64 = 0.5;

/// Cold-start heuristics: (error text, fix, language).
const SEEDS: &[(&str, &str, &str)] = &[
    (
        "ModuleNotFoundError: No module named 'package'",
        "install the missing package and add it to the dependency manifest",
        "python",
    ),
    (
        "error[E0432]: unresolved import",
        "check the module path and add the missing dependency to Cargo.toml",
        "rust",
    ),
    (
        "Cannot find module 'package'",
        "install the package with the project's package manager",
        "javascript",
    ),
    (
        "permission denied",
        "check file permissions and avoid writing outside the workspace",
        "unknown",
    ),
    (
        "address already in use",
        "stop the process holding the port or pick a free one",
        "unknown",
    ),
    (
        "merge conflict in file",
        "resolve the conflict markers, then stage and commit",
        "unknown",
    ),
];

pub const CAPABILITIES_DOCUMENT: &str = "capabilities";
pub const USAGE_REPORT_DOCUMENT: &str = "usage_report";

pub fn context_document_key(project: &str) -> String {
    format!("context:{project}")
}

pub fn skill_document_key(pattern_hash: &str) -> String {
    format!("skill:{pattern_hash}")
}

/// The full default task set.
pub fn default_tasks(
    store: &Arc<MemoryStore>,
    learning: &Arc<SelfLearning>,
    idle: &IdleConfig,
    learning_config: &LearningConfig,
) -> Vec<Arc<dyn BackgroundTask>> {
    vec![
        Arc::new(RevalidateLearnings {
            store: Arc::clone(store),
            decay_factor: idle.decay_factor,
            decay_floor: idle.decay_floor,
        }),
        Arc::new(SeedHeuristics {
            store: Arc::clone(store),
        }),
        Arc::new(RebuildContext {
            store: Arc::clone(store),
        }),
        Arc::new(AssessCapabilities {
            store: Arc::clone(store),
        }),
        Arc::new(GenerateSkills {
            store: Arc::clone(store),
            threshold: learning_config.skill_threshold,
        }),
        Arc::new(BackfillLearnings {
            store: Arc::clone(store),
            learning: Arc::clone(learning),
        }),
        Arc::new(ReportUsage {
            store: Arc::clone(store),
        }),
    ]
}

/// Decay learnings whose referenced files changed.
pub struct RevalidateLearnings {
    store: Arc<MemoryStore>,
    decay_factor: f64,
    decay_floor: f64,
}

impl BackgroundTask for RevalidateLearnings {
    fn name(&self) -> &str {
        "learning_revalidation"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(15 * MINUTE)
    }

    fn run(&self) -> Result<()> {
        let now = Utc::now();
        let (revalidated, decayed) = self.store.update_learnings(|learnings| {
            Ok(revalidate(learnings, self.decay_factor, self.decay_floor, now))
        })?;
        if revalidated > 0 {
            info!(revalidated, decayed, "learnings revalidated");
        }
        Ok(())
    }
}

/// Apply one decay step to every flagged learning. Returns (revalidated, newly decayed).
fn revalidate(
    learnings: &mut [Learning],
    factor: f64,
    floor: f64,
    now: DateTime<Utc>,
) -> (usize, usize) {
    let mut revalidated = 0;
    let mut decayed = 0;
    for learning in learnings.iter_mut().filter(|l| l.needs_revalidation) {
        learning.confidence *= factor;
        learning.needs_revalidation = false;
        learning.updated_at = now;
        revalidated += 1;
        if learning.confidence < floor && !learning.decayed {
            learning.decayed = true;
            decayed += 1;
        }
    }
    (revalidated, decayed)
}

/// Populate shared heuristics once so a fresh install has something to offer.
pub struct SeedHeuristics {
    store: Arc<MemoryStore>,
}

impl BackgroundTask for SeedHeuristics {
    fn name(&self) -> &str {
        "heuristic_seeding"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(24 * HOUR)
    }

    fn run(&self) -> Result<()> {
        let now = Utc::now();
        let seeded = self.store.update_learnings(|learnings| {
            let mut seeded = 0;
            for (error, fix, language) in SEEDS {
                let pattern_hash = hash_error_pattern(error);
                let exists = learnings.iter().any(|l| {
                    l.project_path == SHARED_PROJECT && l.error_pattern_hash == pattern_hash
                });
                if exists {
                    continue;
                }
                learnings.push(Learning {
                    project_path: SHARED_PROJECT.to_string(),
                    language: (*language).to_string(),
                    error_pattern_hash: pattern_hash,
                    error_message: (*error).to_string(),
                    fix_description: (*fix).to_string(),
                    fix_diff: String::new(),
                    confidence: SEED_CONFIDENCE,
                    occurrence_count: 0,
                    needs_revalidation: false,
                    decayed: false,
                    created_at: now,
                    updated_at: now,
                });
                seeded += 1;
            }
            Ok(seeded)
        })?;
        if seeded > 0 {
            info!(seeded, "heuristics seeded");
        }
        Ok(())
    }
}

/// Per-project summary of what the store knows, for prompt context.
pub struct RebuildContext {
    store: Arc<MemoryStore>,
}

impl BackgroundTask for RebuildContext {
    fn name(&self) -> &str {
        "context_rebuild"
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30 * MINUTE)
    }

    fn run(&self) -> Result<()> {
        let learnings = self.store.learnings()?;
        let traces = self.store.traces()?;
        let projects: BTreeSet<&str> = learnings
            .iter()
            .map(|l| l.project_path.as_str())
            .chain(traces.iter().map(|t| t.project_path.as_str()))
            .filter(|p| !p.is_empty() && *p != SHARED_PROJECT)
            .collect();

        for project in &projects {
            let own_learnings: Vec<&Learning> =
                learnings.iter().filter(|l| l.project_path == *project).collect();
            let own_traces: Vec<_> = traces.iter().filter(|t| t.project_path == *project).collect();
            let languages: BTreeSet<&str> =
                own_learnings.iter().map(|l| l.language.as_str()).collect();
            let successful = own_traces
                .iter()
                .filter(|t| t.outcome == TraceOutcome::Success)
                .count();
            let trust = self.store.trust(project)?;
            let document = json!({
                "project": project,
                "learnings": own_learnings.len(),
                "decayed_learnings": own_learnings.iter().filter(|l| l.decayed).count(),
                "languages": languages,
                "decisions": own_traces.len(),
                "successful_decisions": successful,
                "last_decision_at": own_traces.iter().map(|t| t.updated_at).max(),
                "trust_tier": trust.map(|t| t.tier),
                "rebuilt_at": Utc::now(),
            });
            self.store.put_document(&context_document_key(project), document)?;
        }
        debug!(projects = projects.len(), "project context rebuilt");
        Ok(())
    }
}

/// Success rate of past decisions per category.
pub struct AssessCapabilities {
    store: Arc<MemoryStore>,
}

impl BackgroundTask for AssessCapabilities {
    fn name(&self) -> &str {
        "capability_assessment"
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(6 * HOUR)
    }

    fn run(&self) -> Result<()> {
        let traces = self.store.traces()?;
        let mut categories = serde_json::Map::new();
        for category in TraceCategory::ALL {
            let outcomes: Vec<TraceOutcome> = traces
                .iter()
                .filter(|t| t.category == category)
                .map(|t| t.outcome)
                .collect();
            categories.insert(category.as_str().to_string(), capability_entry(&outcomes));
        }
        self.store.put_document(
            CAPABILITIES_DOCUMENT,
            json!({ "assessed_at": Utc::now(), "categories": categories }),
        )
    }
}

fn capability_entry(outcomes: &[TraceOutcome]) -> Value {
    let count = |wanted: TraceOutcome| outcomes.iter().filter(|o| **o == wanted).count();
    let success = count(TraceOutcome::Success);
    let failure = count(TraceOutcome::Failure);
    let partial = count(TraceOutcome::Partial);
    let concluded = success + failure + partial;
    let success_rate = (concluded > 0).then(|| success as f64 / concluded as f64);
    json!({
        "success": success,
        "failure": failure,
        "partial": partial,
        "pending": count(TraceOutcome::Pending),
        "success_rate": success_rate,
    })
}

/// Promote skill candidates that recurred often enough.
pub struct GenerateSkills {
    store: Arc<MemoryStore>,
    threshold: u32,
}

impl BackgroundTask for GenerateSkills {
    fn name(&self) -> &str {
        "skill_generation"
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(HOUR)
    }

    fn run(&self) -> Result<()> {
        let promoted = self.store.update_skills(|skills| {
            let mut promoted = Vec::new();
            for candidate in skills.values_mut() {
                if !candidate.promoted && candidate.occurrence_count >= self.threshold {
                    candidate.promoted = true;
                    promoted.push(candidate.clone());
                }
            }
            Ok(promoted)
        })?;
        for skill in &promoted {
            self.store.put_document(
                &skill_document_key(&skill.pattern_hash),
                json!({
                    "description": skill.description,
                    "occurrences": skill.occurrence_count,
                    "example_tasks": skill.example_task_ids,
                    "promoted_at": Utc::now(),
                }),
            )?;
            info!(
                skill = %skill.pattern_hash,
                occurrences = skill.occurrence_count,
                "skill promoted"
            );
        }
        Ok(())
    }
}

/// Mine execution logs of tasks that finished without learning extraction.
pub struct BackfillLearnings {
    store: Arc<MemoryStore>,
    learning: Arc<SelfLearning>,
}

impl BackgroundTask for BackfillLearnings {
    fn name(&self) -> &str {
        "learning_backfill"
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30 * MINUTE)
    }

    fn run(&self) -> Result<()> {
        let mut mined = 0;
        let mut failed = Vec::new();
        for task_id in self.store.execution_task_ids()? {
            if self.store.is_task_learned(&task_id)? {
                continue;
            }
            match self.learning.learn_from_task(&task_id) {
                Ok(_) => mined += 1,
                Err(err) => {
                    warn!(task_id = %task_id, err = %err, "backfill failed for task");
                    failed.push(task_id);
                }
            }
        }
        if mined > 0 {
            info!(mined, "missed learnings backfilled");
        }
        if !failed.is_empty() {
            bail!("backfill failed for {} task(s): {}", failed.len(), failed.join(", "));
        }
        Ok(())
    }
}

/// Per-day spend summary from the cost ledger.
pub struct ReportUsage {
    store: Arc<MemoryStore>,
}

impl BackgroundTask for ReportUsage {
    fn name(&self) -> &str {
        "token_usage_report"
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(HOUR)
    }

    fn run(&self) -> Result<()> {
        let days = daily_breakdown(&self.store)?;
        let total_usd: f64 = days.values().map(|d| d.cost_usd).sum();
        let mut by_day = serde_json::Map::new();
        for (date, usage) in &days {
            by_day.insert(date.to_string(), serde_json::to_value(usage)?);
        }
        self.store.put_document(
            USAGE_REPORT_DOCUMENT,
            json!({ "generated_at": Utc::now(), "total_usd": total_usd, "days": by_day }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CostEvent;
    use crate::test_support::{TEST_PROJECT, TestStore, error_record, fix_record, trace};

    fn learning(confidence: f64, flagged: bool) -> Learning {
        let now = Utc::now();
        Learning {
            project_path: TEST_PROJECT.to_string(),
            language: "python".to_string(),
            error_pattern_hash: format!("h{confidence}"),
            error_message: "boom".to_string(),
            fix_description: "edit_file: a.py".to_string(),
            fix_diff: String::new(),
            confidence,
            occurrence_count: 1,
            needs_revalidation: flagged,
            decayed: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn revalidation_decays_instead_of_deleting() {
        let mut learnings = vec![learning(0.7, true), learning(0.35, true), learning(0.9, false)];
        let (revalidated, decayed) = revalidate(&mut learnings, 0.8, 0.3, Utc::now());
        assert_eq!((revalidated, decayed), (2, 1));
        assert!((learnings[0].confidence - 0.56).abs() < 1e-9);
        assert!(!learnings[0].decayed);
        assert!(learnings[1].decayed);
        assert!((learnings[2].confidence - 0.9).abs() < 1e-9);
        assert!(learnings.iter().all(|l| !l.needs_revalidation));
    }

    #[test]
    fn seeding_is_idempotent() {
        let store = TestStore::new();
        let task = SeedHeuristics { store: store.store() };
        task.run().expect("seed");
        task.run().expect("seed again");
        let learnings = store.store().learnings().expect("learnings");
        assert_eq!(learnings.len(), SEEDS.len());
        assert!(learnings.iter().all(|l| l.project_path == SHARED_PROJECT));
    }

    #[test]
    fn skills_are_promoted_once_over_threshold() {
        let store = TestStore::new();
        let learner = Arc::new(SelfLearning::new(store.store(), LearningConfig::default()));
        for task in ["t1", "t2", "t3"] {
            store.store().append_execution(&error_record(task, "KeyError: 'id'")).expect("append");
            store.store().append_execution(&fix_record(task, "app.py")).expect("append");
            learner.learn_from_task(task).expect("learn");
        }
        let task = GenerateSkills {
            store: store.store(),
            threshold: 3,
        };
        task.run().expect("generate");
        let skills = store.store().skills().expect("skills");
        assert_eq!(skills.len(), 1);
        assert!(skills[0].promoted);
        let key = skill_document_key(&skills[0].pattern_hash);
        assert!(store.store().document(&key).expect("doc").is_some());
    }

    #[test]
    fn backfill_learns_only_unlearned_tasks() {
        let store = TestStore::new();
        let learner = Arc::new(SelfLearning::new(store.store(), LearningConfig::default()));
        for task in ["t1", "t2"] {
            store.store().append_execution(&error_record(task, "boom")).expect("append");
            store.store().append_execution(&fix_record(task, "a.py")).expect("append");
        }
        learner.learn_from_task("t1").expect("learn");
        let task = BackfillLearnings {
            store: store.store(),
            learning: Arc::clone(&learner),
        };
        task.run().expect("backfill");
        assert!(store.store().is_task_learned("t2").expect("learned"));
        let learnings = store.store().learnings().expect("learnings");
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].occurrence_count, 2);
    }

    #[test]
    fn capability_rates_ignore_pending() {
        let entry = capability_entry(&[
            TraceOutcome::Success,
            TraceOutcome::Success,
            TraceOutcome::Failure,
            TraceOutcome::Pending,
        ]);
        assert_eq!(entry["pending"], 1);
        let rate = entry["success_rate"].as_f64().expect("rate");
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(capability_entry(&[]).get("success_rate").is_some_and(Value::is_null));
    }

    #[test]
    fn context_and_usage_documents_are_written() {
        let store = TestStore::new();
        store
            .store()
            .insert_trace(|id| trace(&id, TraceOutcome::Success))
            .expect("trace");
        let now = Utc::now();
        store
            .store()
            .append_cost(&CostEvent {
                session_id: "s".to_string(),
                timestamp: now,
                date: now.date_naive(),
                cost_usd: 1.5,
                turns: 3,
                task: "t".to_string(),
            })
            .expect("cost");

        RebuildContext { store: store.store() }.run().expect("context");
        ReportUsage { store: store.store() }.run().expect("usage");
        AssessCapabilities { store: store.store() }.run().expect("capabilities");

        let context = store
            .store()
            .document(&context_document_key(TEST_PROJECT))
            .expect("doc")
            .expect("context");
        assert_eq!(context["decisions"], 1);
        let usage = store.store().document(USAGE_REPORT_DOCUMENT).expect("doc").expect("usage");
        assert_eq!(usage["total_usd"], 1.5);
        let capabilities = store
            .store()
            .document(CAPABILITIES_DOCUMENT)
            .expect("doc")
            .expect("caps");
        assert_eq!(capabilities["categories"]["task_execution"]["success"], 1);
    }
}
