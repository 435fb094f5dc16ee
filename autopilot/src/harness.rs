//! Build Harness: the plan -> implement -> test loop for one project.
//!
//! The loop is an explicit state machine over [`HarnessState`]. Every
//! transition is validated against the table and the context is written to
//! `<project>/.autopilot/harness.json` right after it is applied, so a
//! crashed run resumes where it stopped.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::budget::BudgetController;
use crate::core::features::{Feature, FeatureStatus};
use crate::core::harness_state::{HarnessContext, HarnessState, TransitionRecord};
use crate::core::plan::{fallback_plan, parse_plan};
use crate::core::types::{TraceCategory, TraceOutcome};
use crate::features::FeatureManager;
use crate::io::agent::{AgentResult, AgentRunner};
use crate::io::config::HarnessConfig;
use crate::io::project_state::{ProjectPaths, load_harness_context, write_harness_context};
use crate::io::prompt::{ImplementPrompt, PrecedentGuidance, PromptRenderer, TestPrompt};
use crate::learning::SelfLearning;
use crate::tracer::{DecisionTracer, TraceDraft};

const PROMPT_LEARNINGS: usize = 5;

/// Collaborators shared with the rest of the process.
#[derive(Clone)]
pub struct HarnessDeps {
    pub runner: Arc<dyn AgentRunner>,
    pub budget: Arc<BudgetController>,
    pub tracer: Arc<DecisionTracer>,
    /// Source of known fixes for prompts; optional.
    pub learning: Option<Arc<SelfLearning>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    BudgetExhausted(String),
}

/// Final state plus the full history, enough to explain why the loop stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessOutcome {
    pub final_state: HarnessState,
    pub stop_reason: StopReason,
    pub history: Vec<TransitionRecord>,
    pub features: Vec<Feature>,
}

enum Step {
    Continue,
    Stop(StopReason),
}

pub struct BuildHarness {
    project: String,
    paths: ProjectPaths,
    goal: String,
    config: HarnessConfig,
    deps: HarnessDeps,
    prompts: PromptRenderer,
    context: HarnessContext,
    features: FeatureManager,
    last_failure: Option<String>,
}

impl BuildHarness {
    /// Health-check the project and load (or start) its harness context.
    ///
    /// A missing project directory is fatal; a missing state directory is
    /// created.
    pub fn new(
        project_root: &Path,
        goal: &str,
        config: HarnessConfig,
        session_id: &str,
        deps: HarnessDeps,
    ) -> Result<Self> {
        let paths = ProjectPaths::new(project_root);
        let health = health_check(&paths)?;
        let project = project_root.display().to_string();
        let mut context = match load_harness_context(&paths.harness_path)? {
            Some(context) => {
                info!(project = %project, state = %context.state, "resuming harness");
                context
            }
            None => HarnessContext::new(project.clone(), session_id),
        };
        context.health = health;
        let features = FeatureManager::open(project_root)?;
        Ok(Self {
            project,
            goal: goal.to_string(),
            prompts: PromptRenderer::new(config.prompt_budget_bytes),
            config,
            deps,
            context,
            features,
            last_failure: None,
            paths,
        })
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    pub fn features(&self) -> &FeatureManager {
        &self.features
    }

    /// Drive the state machine until `complete` or a budget halt.
    #[instrument(skip_all, fields(project = %self.project))]
    pub fn run(&mut self) -> Result<HarnessOutcome> {
        write_harness_context(&self.paths.harness_path, &self.context)?;
        let stop_reason = loop {
            if self.context.state == HarnessState::Complete {
                break StopReason::Completed;
            }
            if let Some(reason) = self.budget_halt()? {
                break reason;
            }
            let step = match self.context.state {
                HarnessState::Start => {
                    self.advance(HarnessState::Init, None).map(|()| Step::Continue)
                }
                HarnessState::Init => self.step_init(),
                HarnessState::Implement => self.step_implement(),
                HarnessState::Test => self.step_test(),
                HarnessState::Complete => Ok(Step::Continue),
            }?;
            if let Step::Stop(reason) = step {
                break reason;
            }
        };
        info!(state = %self.context.state, reason = ?stop_reason, "harness stopped");
        Ok(HarnessOutcome {
            final_state: self.context.state,
            stop_reason,
            history: self.context.history.clone(),
            features: self.features.features().to_vec(),
        })
    }

    fn budget_halt(&self) -> Result<Option<StopReason>> {
        let admission = self.deps.budget.enforce()?;
        if admission.allowed {
            return Ok(None);
        }
        warn!(reason = %admission.reason, "budget exhausted, halting harness");
        Ok(Some(StopReason::BudgetExhausted(admission.reason)))
    }

    fn advance(&mut self, to: HarnessState, feature_id: Option<&str>) -> Result<()> {
        let from = self.context.state;
        self.context.transition(to, feature_id)?;
        write_harness_context(&self.paths.harness_path, &self.context)?;
        debug!(from = %from, to = %to, feature = ?feature_id, "harness transition");
        Ok(())
    }

    fn persist_context(&self) -> Result<()> {
        write_harness_context(&self.paths.harness_path, &self.context)
    }

    fn step_init(&mut self) -> Result<Step> {
        let learnings = self.learnings();
        let prompt = self.prompts.render_plan(&self.project, &self.goal, &learnings)?;
        let result = self.run_agent(&prompt, &format!("plan: {}", self.goal))?;

        let (plan, outcome) = match result
            .succeeded()
            .then(|| parse_plan(&result.output))
        {
            Some(Ok(plan)) => (plan, TraceOutcome::Success),
            Some(Err(err)) => {
                warn!(err = %err, "plan output unusable, falling back to a single feature");
                (fallback_plan(&self.goal), TraceOutcome::Partial)
            }
            None => {
                warn!(
                    status = %result.status,
                    "planning agent did not complete, falling back to a single feature"
                );
                (fallback_plan(&self.goal), TraceOutcome::Partial)
            }
        };
        self.features.load_from_plan(&plan)?;
        self.record_trace(TraceDraft {
            category: TraceCategory::Architecture,
            description: self.goal.clone(),
            decision: format!("planned {} feature(s)", plan.subtasks.len()),
            context: json!({ "features": plan.subtasks.iter().map(|s| &s.id).collect::<Vec<_>>() }),
            outcome,
            project_path: self.project.clone(),
        });
        self.advance(HarnessState::Implement, None)?;
        Ok(Step::Continue)
    }

    fn step_implement(&mut self) -> Result<Step> {
        let Some(feature) = self.claim_feature()? else {
            self.advance(HarnessState::Test, None)?;
            return Ok(Step::Continue);
        };
        let id = feature.id.clone();

        let precedents = self
            .deps
            .tracer
            .query_precedents(
                &feature.description,
                TraceCategory::TaskExecution,
                self.config.precedent_limit,
            )
            .unwrap_or_else(|err| {
                warn!(err = %err, "precedent lookup failed");
                Vec::new()
            });
        let recommendation = self.deps.tracer.get_recommendation(&precedents);
        debug!(
            feature = %id,
            action = recommendation.action.as_str(),
            reason = %recommendation.reason,
            "precedent recommendation"
        );

        let learnings = self.learnings();
        let prompt = self.prompts.render_implement(&ImplementPrompt {
            project: &self.project,
            feature: &feature,
            precedent: PrecedentGuidance::from_recommendation(&recommendation),
            attempt: feature.attempts + 1,
            previous_failure: self.last_failure.as_deref(),
            learnings: &learnings,
        })?;
        let trace_id = self.record_trace(TraceDraft {
            category: TraceCategory::TaskExecution,
            description: feature.description.clone(),
            decision: format!("implement {id} ({})", recommendation.action.as_str()),
            context: json!({ "feature_id": id, "attempt": feature.attempts + 1 }),
            outcome: TraceOutcome::Pending,
            project_path: self.project.clone(),
        });

        let result = self.run_agent(&prompt, &format!("implement {id}"))?;
        self.features.record_cost(&id, result.cost_usd)?;

        if result.succeeded() {
            self.features.mark_status(&id, FeatureStatus::Implemented)?;
            self.features.reset_attempts(&id)?;
            self.close_trace(trace_id, TraceOutcome::Success);
            self.last_failure = None;
            self.context.current_feature = None;
            self.context.attempts = 0;
            let next = if self.features.get_next_pending().is_some() {
                HarnessState::Implement
            } else {
                HarnessState::Test
            };
            info!(feature = %id, "feature implemented");
            self.advance(next, Some(&id))?;
            return Ok(Step::Continue);
        }

        self.close_trace(trace_id, TraceOutcome::Failure);
        let attempts = self.features.increment_attempts(&id)?;
        self.context.attempts = attempts;
        self.last_failure = Some(result.output);
        if attempts >= self.config.max_feature_attempts {
            warn!(feature = %id, attempts, "feature blocked after repeated failures");
            self.features.mark_status(&id, FeatureStatus::Blocked)?;
            self.context.current_feature = None;
            self.context.attempts = 0;
            self.last_failure = None;
            self.advance(HarnessState::Test, Some(&id))?;
        } else {
            info!(feature = %id, attempts, "feature attempt failed, retrying");
            self.advance(HarnessState::Implement, Some(&id))?;
        }
        Ok(Step::Continue)
    }

    /// The in-progress feature being retried, or the next ready one marked in progress.
    fn claim_feature(&mut self) -> Result<Option<Feature>> {
        if let Some(id) = self.context.current_feature.clone()
            && let Some(feature) = self.features.get(&id)
            && feature.status == FeatureStatus::InProgress
        {
            return Ok(Some(feature.clone()));
        }
        // A crash between claiming and persisting leaves an orphaned in-progress feature.
        let orphan = self
            .features
            .features_in(FeatureStatus::InProgress)
            .first()
            .map(|f| (*f).clone());
        if let Some(orphan) = orphan {
            self.context.current_feature = Some(orphan.id.clone());
            self.persist_context()?;
            return Ok(Some(orphan));
        }
        let Some(next) = self.features.get_next_pending().cloned() else {
            return Ok(None);
        };
        self.features.mark_status(&next.id, FeatureStatus::InProgress)?;
        self.context.current_feature = Some(next.id.clone());
        self.context.attempts = 0;
        self.last_failure = None;
        self.persist_context()?;
        Ok(self.features.get(&next.id).cloned())
    }

    fn step_test(&mut self) -> Result<Step> {
        let implemented: Vec<Feature> = self
            .features
            .features_in(FeatureStatus::Implemented)
            .into_iter()
            .cloned()
            .collect();
        if implemented.is_empty() {
            let next = if self.features.get_next_pending().is_some() {
                HarnessState::Implement
            } else {
                HarnessState::Complete
            };
            self.advance(next, None)?;
            return Ok(Step::Continue);
        }

        let ids: Vec<String> = implemented.iter().map(|f| f.id.clone()).collect();
        let trace_id = self.record_trace(TraceDraft {
            category: TraceCategory::Testing,
            description: format!("validate {}", ids.join(", ")),
            decision: "run batch validation of implemented features".to_string(),
            context: json!({ "features": ids }),
            outcome: TraceOutcome::Pending,
            project_path: self.project.clone(),
        });

        let mut previous_failure: Option<String> = None;
        for attempt in 1..=self.config.max_test_attempts {
            if attempt > 1
                && let Some(reason) = self.budget_halt()?
            {
                self.close_trace(trace_id, TraceOutcome::Partial);
                return Ok(Step::Stop(reason));
            }
            let prompt = self.prompts.render_test(&TestPrompt {
                project: &self.project,
                features: &implemented,
                attempt,
                previous_failure: previous_failure.as_deref(),
            })?;
            let result = self.run_agent(&prompt, &format!("test {}", ids.join(",")))?;
            if result.succeeded() {
                for id in &ids {
                    self.features.mark_status(id, FeatureStatus::Tested)?;
                }
                self.close_trace(trace_id, TraceOutcome::Success);
                self.context.attempts = 0;
                info!(features = ?ids, attempt, "feature batch tested");
                let next = if self.features.get_next_pending().is_some() {
                    HarnessState::Implement
                } else {
                    HarnessState::Complete
                };
                self.advance(next, None)?;
                return Ok(Step::Continue);
            }
            warn!(attempt, max = self.config.max_test_attempts, "batch test failed");
            self.context.attempts = attempt;
            self.persist_context()?;
            previous_failure = Some(result.output);
        }

        warn!(features = ?ids, "blocking every implemented feature after failed test batch");
        for id in &ids {
            self.features.mark_status(id, FeatureStatus::Blocked)?;
        }
        self.close_trace(trace_id, TraceOutcome::Failure);
        self.context.attempts = 0;
        self.advance(HarnessState::Complete, None)?;
        Ok(Step::Continue)
    }

    /// Run the agent and book its cost. Adapter errors count as an `error` result.
    fn run_agent(&self, prompt: &str, task: &str) -> Result<AgentResult> {
        let result = match self.deps.runner.run_task(prompt) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %err, "agent runner failed");
                AgentResult::adapter_error(&err)
            }
        };
        self.deps
            .budget
            .record_cost(result.cost_usd, result.turns, task)
            .context("record agent cost")?;
        Ok(result)
    }

    fn learnings(&self) -> Vec<String> {
        let Some(learning) = &self.deps.learning else {
            return Vec::new();
        };
        learning
            .relevant_learnings(&self.project, PROMPT_LEARNINGS)
            .unwrap_or_else(|err| {
                warn!(err = %err, "loading learnings for prompt failed");
                Vec::new()
            })
    }

    fn record_trace(&self, draft: TraceDraft) -> Option<String> {
        match self.deps.tracer.store_trace(draft) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(err = %err, "storing decision trace failed");
                None
            }
        }
    }

    fn close_trace(&self, trace_id: Option<String>, outcome: TraceOutcome) {
        let Some(id) = trace_id else {
            return;
        };
        if let Err(err) = self.deps.tracer.update_outcome(&id, outcome) {
            warn!(trace_id = %id, err = %err, "updating decision trace failed");
        }
    }
}

fn health_check(paths: &ProjectPaths) -> Result<String> {
    if !paths.root.is_dir() {
        bail!("project path does not exist: {}", paths.root.display());
    }
    if paths.state_dir.is_dir() {
        return Ok("ok".to_string());
    }
    match fs::create_dir_all(&paths.state_dir) {
        Ok(()) => {
            info!(dir = %paths.state_dir.display(), "created project state directory");
            Ok("healed: created state directory".to_string())
        }
        Err(err) => {
            warn!(
                dir = %paths.state_dir.display(),
                err = %err,
                "cannot create project state directory"
            );
            Ok(format!("degraded: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::BudgetLimits;
    use crate::core::harness_state::is_allowed_transition;
    use crate::test_support::{ScriptedAgentRunner, TestStore, agent_fail, agent_ok};

    const PLAN: &str = r#"{"subtasks":[
        {"id":"F1","description":"core model"},
        {"id":"F2","description":"api layer","dependencies":["F1"]}
    ]}"#;

    struct Fixture {
        store: TestStore,
        project: tempfile::TempDir,
        runner: Arc<ScriptedAgentRunner>,
    }

    impl Fixture {
        fn new(script: Vec<AgentResult>) -> Self {
            Self {
                store: TestStore::new(),
                project: tempfile::tempdir().expect("tempdir"),
                runner: Arc::new(ScriptedAgentRunner::new(script)),
            }
        }

        fn harness(&self, limits: BudgetLimits) -> BuildHarness {
            let deps = HarnessDeps {
                runner: self.runner.clone(),
                budget: Arc::new(BudgetController::new(self.store.store(), limits, "s1")),
                tracer: Arc::new(DecisionTracer::new(self.store.store())),
                learning: None,
            };
            BuildHarness::new(self.project.path(), "build it", HarnessConfig::default(), "s1", deps)
                .expect("harness")
        }
    }

    fn assert_legal(history: &[TransitionRecord]) {
        for record in history {
            assert!(is_allowed_transition(record.from, record.to), "{record:?}");
        }
    }

    fn status(outcome: &HarnessOutcome, id: &str) -> FeatureStatus {
        outcome
            .features
            .iter()
            .find(|f| f.id == id)
            .map(|f| f.status)
            .expect("feature")
    }

    #[test]
    fn missing_project_is_fatal() {
        let store = TestStore::new();
        let deps = HarnessDeps {
            runner: Arc::new(ScriptedAgentRunner::new(Vec::new())),
            budget: Arc::new(BudgetController::new(store.store(), BudgetLimits::default(), "s")),
            tracer: Arc::new(DecisionTracer::new(store.store())),
            learning: None,
        };
        let err = BuildHarness::new(
            Path::new("/definitely/not/here"),
            "g",
            HarnessConfig::default(),
            "s",
            deps,
        )
        .err()
        .expect("fatal");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn state_directory_is_healed() {
        let fixture = Fixture::new(Vec::new());
        let harness = fixture.harness(BudgetLimits::default());
        assert!(harness.context().health.starts_with("healed"));
        assert!(fixture.project.path().join(".autopilot").is_dir());
    }

    /// A feature failing three times is blocked and its dependents never run.
    #[test]
    fn failing_feature_is_blocked_and_loop_completes() {
        let fixture = Fixture::new(vec![
            agent_ok(PLAN),
            agent_fail("compile error"),
            agent_fail("compile error"),
            agent_fail("compile error"),
        ]);
        let outcome = fixture.harness(BudgetLimits::default()).run().expect("run");
        assert_eq!(outcome.final_state, HarnessState::Complete);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(status(&outcome, "F1"), FeatureStatus::Blocked);
        assert_eq!(status(&outcome, "F2"), FeatureStatus::Pending);
        assert_legal(&outcome.history);
        assert_eq!(fixture.runner.calls(), 4);
    }

    /// Three failed batch tests block every implemented feature.
    #[test]
    fn failed_test_batch_blocks_all_implemented() {
        let fixture = Fixture::new(vec![
            agent_ok(r#"{"subtasks":[{"id":"A","description":"a"},{"id":"B","description":"b"}]}"#),
            agent_ok("done A"),
            agent_ok("done B"),
            agent_fail("tests red"),
            agent_fail("tests red"),
            agent_fail("tests red"),
        ]);
        let outcome = fixture.harness(BudgetLimits::default()).run().expect("run");
        assert_eq!(outcome.final_state, HarnessState::Complete);
        assert_eq!(status(&outcome, "A"), FeatureStatus::Blocked);
        assert_eq!(status(&outcome, "B"), FeatureStatus::Blocked);
        assert_legal(&outcome.history);
        assert!(fixture.runner.prompts()[5].contains("tests red"));
    }

    #[test]
    fn unparseable_plan_falls_back_to_one_feature() {
        let fixture = Fixture::new(vec![
            agent_ok("Sorry, I can only describe the plan in prose."),
            agent_ok("implemented"),
            agent_ok("all tests pass"),
        ]);
        let outcome = fixture.harness(BudgetLimits::default()).run().expect("run");
        assert_eq!(outcome.final_state, HarnessState::Complete);
        assert_eq!(outcome.features.len(), 1);
        assert_eq!(outcome.features[0].status, FeatureStatus::Tested);
        assert_eq!(outcome.features[0].description, "build it");
    }

    #[test]
    fn cyclic_plan_fails_loudly() {
        let plan = serde_json::json!({
            "subtasks": [
                {"id": "A", "description": "a", "dependencies": ["B"]},
                {"id": "B", "description": "b", "dependencies": ["A"]},
            ]
        });
        let fixture = Fixture::new(vec![agent_ok(&plan.to_string())]);
        let err = fixture.harness(BudgetLimits::default()).run().expect_err("cycle");
        assert!(format!("{err:#}").contains("dependency cycle"));
    }

    #[test]
    fn exhausted_budget_halts_the_loop() {
        let mut plan = agent_ok(PLAN);
        plan.cost_usd = 2.0;
        let fixture = Fixture::new(vec![plan, agent_ok("never used")]);
        let limits = BudgetLimits {
            session_cap_usd: 1.0,
            ..BudgetLimits::default()
        };
        let outcome = fixture.harness(limits).run().expect("run");
        assert_eq!(outcome.final_state, HarnessState::Implement);
        assert!(matches!(
            &outcome.stop_reason,
            StopReason::BudgetExhausted(reason) if reason.starts_with("Session")
        ));
        assert_eq!(fixture.runner.calls(), 1);
    }

    /// A fresh harness on the same project picks up the persisted context.
    #[test]
    fn resumes_from_persisted_context() {
        let mut plan = agent_ok(PLAN);
        plan.cost_usd = 2.0;
        let fixture = Fixture::new(vec![
            plan,
            agent_ok("F1 done"),
            agent_ok("tests pass"),
            agent_ok("F2 done"),
            agent_ok("tests pass"),
        ]);
        let tight = BudgetLimits {
            session_cap_usd: 1.0,
            ..BudgetLimits::default()
        };
        fixture.harness(tight).run().expect("first run");

        let outcome = fixture.harness(BudgetLimits::default()).run().expect("resume");
        assert_eq!(outcome.final_state, HarnessState::Complete);
        assert_eq!(outcome.history.first().map(|r| r.to), Some(HarnessState::Init));
        assert_eq!(status(&outcome, "F2"), FeatureStatus::Tested);
        assert_legal(&outcome.history);
    }
}
