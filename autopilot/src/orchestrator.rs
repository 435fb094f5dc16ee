//! One task through the control plane: admission, routing, execution and
//! the bookkeeping that follows.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::budget::BudgetController;
use crate::core::loops::LoopVerdict;
use crate::core::recommend::Recommendation;
use crate::core::trust::Action;
use crate::core::types::{ExecutionRecord, TraceCategory, TraceOutcome};
use crate::io::agent::{AgentResult, AgentRunner};
use crate::io::command::{CommandExecutor, CommandOutcome};
use crate::io::config::AutopilotConfig;
use crate::io::prompt::{PrecedentGuidance, PromptRenderer, TaskPrompt};
use crate::io::store::MemoryStore;
use crate::learning::{LearningReport, SelfLearning};
use crate::loops::{LoopDetector, subtask_key};
use crate::router::{ModelRouter, RouteTier, RoutingDecision};
use crate::tracer::{DecisionTracer, TraceDraft};
use crate::trust::TrustEngine;

const PROMPT_LEARNINGS: usize = 5;

/// The shared components of one process, built from a config.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<MemoryStore>,
    pub trust: Arc<TrustEngine>,
    pub budget: Arc<BudgetController>,
    pub loops: Arc<LoopDetector>,
    pub tracer: Arc<DecisionTracer>,
    pub learning: Arc<SelfLearning>,
    pub router: Arc<ModelRouter>,
}

impl Components {
    pub fn from_config(
        store: Arc<MemoryStore>,
        config: &AutopilotConfig,
        session_id: &str,
    ) -> Self {
        Self {
            trust: Arc::new(TrustEngine::new(Arc::clone(&store), config.trust)),
            budget: Arc::new(BudgetController::new(Arc::clone(&store), config.budget, session_id)),
            loops: Arc::new(LoopDetector::new(config.loops)),
            tracer: Arc::new(DecisionTracer::new(Arc::clone(&store))),
            learning: Arc::new(SelfLearning::new(Arc::clone(&store), config.learning.clone())),
            router: Arc::new(ModelRouter::new(config.router.clone())),
            store,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: String,
    pub project: String,
    pub description: String,
    pub files: Vec<String>,
    /// The gated action the task needs.
    pub action: Action,
    pub category: TraceCategory,
    pub offline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskDisposition {
    TrustDenied(String),
    BudgetDenied(String),
    Unroutable(String),
    Completed,
    Failed,
}

/// Everything decided and observed for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub disposition: TaskDisposition,
    pub routing: Option<RoutingDecision>,
    pub recommendation: Option<Recommendation>,
    pub agent: Option<AgentResult>,
    pub trace_id: Option<String>,
    pub learning: Option<LearningReport>,
    /// Tier change message, when the outcome moved the tier.
    pub trust_change: Option<String>,
}

impl TaskReport {
    fn refused(
        task_id: &str,
        disposition: TaskDisposition,
        routing: Option<RoutingDecision>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            disposition,
            routing,
            recommendation: None,
            agent: None,
            trace_id: None,
            learning: None,
            trust_change: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandRun {
    Denied(String),
    Ran {
        outcome: CommandOutcome,
        verdict: LoopVerdict,
    },
}

pub struct Orchestrator {
    components: Components,
    runner: Arc<dyn AgentRunner>,
    executor: Option<Arc<dyn CommandExecutor>>,
    prompts: PromptRenderer,
    precedent_limit: usize,
}

impl Orchestrator {
    pub fn new(
        components: Components,
        runner: Arc<dyn AgentRunner>,
        config: &AutopilotConfig,
    ) -> Self {
        Self {
            components,
            runner,
            executor: None,
            prompts: PromptRenderer::new(config.harness.prompt_budget_bytes),
            precedent_limit: config.harness.precedent_limit,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Run one task end to end.
    ///
    /// Denials come back as a report, not an error. Learning extraction and
    /// trace storage are best-effort.
    #[instrument(skip_all, fields(task_id = %request.task_id, project = %request.project))]
    pub fn run_task(&self, request: &TaskRequest) -> Result<TaskReport> {
        let c = &self.components;
        let trust = c.trust.can_perform(&request.project, request.action)?;
        if !trust.allowed {
            info!(reason = %trust.reason, "task refused by trust policy");
            return Ok(TaskReport::refused(
                &request.task_id,
                TaskDisposition::TrustDenied(trust.reason),
                None,
            ));
        }
        let budget = c.budget.enforce()?;
        if !budget.allowed {
            info!(reason = %budget.reason, "task refused by budget");
            return Ok(TaskReport::refused(
                &request.task_id,
                TaskDisposition::BudgetDenied(budget.reason),
                None,
            ));
        }

        let routing = c.router.route(
            &request.description,
            &request.files,
            c.budget.remaining_usd()?,
            request.offline,
        );
        if routing.tier == RouteTier::Unavailable {
            info!(justification = %routing.justification, "no model tier available");
            let reason = routing.justification.clone();
            return Ok(TaskReport::refused(
                &request.task_id,
                TaskDisposition::Unroutable(reason),
                Some(routing),
            ));
        }
        debug!(tier = routing.tier.as_str(), model = ?routing.model, "task routed");

        let precedents = c
            .tracer
            .query_precedents(&request.description, request.category, self.precedent_limit)
            .unwrap_or_else(|err| {
                warn!(err = %err, "precedent lookup failed");
                Vec::new()
            });
        let recommendation = c.tracer.get_recommendation(&precedents);
        let learnings = c
            .learning
            .relevant_learnings(&request.project, PROMPT_LEARNINGS)
            .unwrap_or_else(|err| {
                warn!(err = %err, "loading learnings failed");
                Vec::new()
            });
        let files = routing.filtered_files.as_deref().unwrap_or(&request.files);
        let prompt = self.prompts.render_task(&TaskPrompt {
            project: &request.project,
            task: &request.description,
            files,
            precedent: PrecedentGuidance::from_recommendation(&recommendation),
            learnings: &learnings,
        })?;

        let result = self.runner.run_task(&prompt).unwrap_or_else(|err| {
            warn!(err = %err, "agent runner failed");
            AgentResult::adapter_error(&err)
        });
        c.budget
            .record_cost(result.cost_usd, result.turns, &request.task_id)?;

        let learning = match c.learning.learn_from_task(&request.task_id) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(err = %err, "learning extraction failed");
                None
            }
        };
        let outcome = if result.succeeded() {
            TraceOutcome::Success
        } else {
            TraceOutcome::Failure
        };
        let trace_id = match c.tracer.store_trace(TraceDraft {
            category: request.category,
            description: request.description.clone(),
            decision: format!(
                "{} via {}",
                recommendation.action.as_str(),
                routing.model.as_deref().unwrap_or(routing.tier.as_str())
            ),
            context: json!({
                "task_id": request.task_id,
                "tier": routing.tier.as_str(),
                "cost_usd": result.cost_usd,
                "turns": result.turns,
            }),
            outcome,
            project_path: request.project.clone(),
        }) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(err = %err, "storing decision trace failed");
                None
            }
        };

        let (disposition, trust_change) = if result.succeeded() {
            (TaskDisposition::Completed, c.trust.record_success(&request.project)?)
        } else {
            c.trust.record_failure(&request.project)?;
            (TaskDisposition::Failed, None)
        };
        if let Some(change) = &trust_change {
            info!(change = %change, "trust tier changed");
        }
        c.loops.end_task(&request.task_id)?;

        info!(status = %result.status, cost_usd = result.cost_usd, "task finished");
        Ok(TaskReport {
            task_id: request.task_id.clone(),
            disposition,
            routing: Some(routing),
            recommendation: Some(recommendation),
            agent: Some(result),
            trace_id,
            learning,
            trust_change,
        })
    }

    /// Log one tool invocation and feed it to the loop detector.
    pub fn record_tool_call(
        &self,
        subtask_id: &str,
        record: &ExecutionRecord,
    ) -> Result<LoopVerdict> {
        self.components.store.append_execution(record)?;
        self.components.loops.record_iteration(
            &subtask_key(&record.task_id, subtask_id),
            &record.tool_name,
            &record.input,
            &record.output,
            record.error.as_deref(),
        )
    }

    /// Run a shell command for a task, gated by the trust tier and logged like any tool call.
    pub fn run_command(
        &self,
        project: &str,
        task_id: &str,
        subtask_id: &str,
        command: &str,
    ) -> Result<CommandRun> {
        let admission = self.components.trust.can_perform(project, Action::RunCommand)?;
        if !admission.allowed {
            return Ok(CommandRun::Denied(admission.reason));
        }
        let Some(executor) = &self.executor else {
            return Ok(CommandRun::Denied("no command executor configured".to_string()));
        };
        let outcome = executor.run(command)?;
        let error = (!outcome.success()).then(|| {
            let stderr = outcome.stderr.trim();
            if stderr.is_empty() {
                format!("exit code {}", outcome.exit_code)
            } else {
                stderr.to_string()
            }
        });
        let record = ExecutionRecord {
            task_id: task_id.to_string(),
            project_path: project.to_string(),
            tool_name: "bash".to_string(),
            input: command.to_string(),
            output: format!("{}{}", outcome.stdout, outcome.stderr),
            exit_code: Some(outcome.exit_code),
            error,
            files_touched: Vec::new(),
            timestamp: Utc::now(),
        };
        let verdict = self.record_tool_call(subtask_id, &record)?;
        Ok(CommandRun::Ran { outcome, verdict })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loops::LoopAction;
    use crate::test_support::{
        ScriptedAgentRunner, TEST_PROJECT, TestStore, agent_ok, error_record, read_record,
    };

    fn orchestrator(store: &TestStore, script: Vec<AgentResult>) -> Orchestrator {
        let config = AutopilotConfig::default();
        let components = Components::from_config(store.store(), &config, "s1");
        Orchestrator::new(components, Arc::new(ScriptedAgentRunner::new(script)), &config)
    }

    fn request(action: Action) -> TaskRequest {
        TaskRequest {
            task_id: "t1".to_string(),
            project: TEST_PROJECT.to_string(),
            description: "fix the typo in the readme".to_string(),
            files: vec!["README.md".to_string()],
            action,
            category: TraceCategory::TaskExecution,
            offline: false,
        }
    }

    #[test]
    fn untrusted_action_never_reaches_the_agent() {
        let store = TestStore::new();
        let report = orchestrator(&store, Vec::new())
            .run_task(&request(Action::DeployProduction))
            .expect("run");
        assert!(matches!(report.disposition, TaskDisposition::TrustDenied(_)));
        assert!(report.agent.is_none());
        assert!(store.store().costs().expect("costs").is_empty());
    }

    #[test]
    fn offline_without_local_model_is_unroutable() {
        let store = TestStore::new();
        let mut req = request(Action::ReadFile);
        req.offline = true;
        let report = orchestrator(&store, Vec::new()).run_task(&req).expect("run");
        assert!(matches!(report.disposition, TaskDisposition::Unroutable(_)));
        assert_eq!(report.routing.expect("routing").tier, RouteTier::Unavailable);
    }

    #[test]
    fn completed_task_is_traced_and_counted() {
        let store = TestStore::new();
        let mut result = agent_ok("done");
        result.cost_usd = 0.25;
        let orchestrator = orchestrator(&store, vec![result]);
        let report = orchestrator.run_task(&request(Action::ReadFile)).expect("run");
        assert_eq!(report.disposition, TaskDisposition::Completed);
        let trace = store
            .store()
            .trace(report.trace_id.as_deref().expect("trace id"))
            .expect("read")
            .expect("trace");
        assert_eq!(trace.outcome, TraceOutcome::Success);
        assert_eq!(store.store().costs().expect("costs").len(), 1);
        let score = orchestrator.components().trust.score(TEST_PROJECT).expect("score");
        assert_eq!(score.consecutive_successes, 1);
    }

    #[test]
    fn tool_calls_are_logged_and_loop_checked() {
        let store = TestStore::new();
        let orchestrator = orchestrator(&store, Vec::new());
        let mut verdict = None;
        for _ in 0..3 {
            verdict = Some(
                orchestrator
                    .record_tool_call("s1", &error_record("t1", "same failure"))
                    .expect("record"),
            );
        }
        assert_ne!(verdict.expect("verdict").action, LoopAction::Continue);
        orchestrator
            .record_tool_call("s1", &read_record("t1", "src/lib.rs"))
            .expect("record");
        assert_eq!(store.store().executions("t1").expect("log").len(), 4);
    }

    #[test]
    fn commands_need_trust_and_an_executor() {
        let store = TestStore::new();
        let orchestrator = orchestrator(&store, Vec::new());
        let run = orchestrator
            .run_command(TEST_PROJECT, "t1", "s1", "ls")
            .expect("run");
        assert!(matches!(run, CommandRun::Denied(_)));
    }
}
