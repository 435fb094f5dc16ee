//! Test-only builders for records, features, traces and a scratch store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use crate::core::features::{Feature, FeatureStatus};
use crate::core::types::{DecisionTrace, ExecutionRecord, TraceCategory, TraceOutcome};
use crate::io::agent::{AgentResult, AgentRunner, RunStatus};
use crate::io::store::MemoryStore;

pub const TEST_PROJECT: &str = "/repo";

/// Create a pending feature with deterministic defaults.
pub fn feature(id: &str, priority: u32, dependencies: &[&str]) -> Feature {
    Feature {
        id: id.to_string(),
        description: format!("{id} description"),
        priority,
        status: FeatureStatus::Pending,
        phase: "implementation".to_string(),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        acceptance_criteria: Vec::new(),
        attempts: 0,
        cost_usd: 0.0,
    }
}

pub fn trace(id: &str, outcome: TraceOutcome) -> DecisionTrace {
    let now = Utc::now();
    DecisionTrace {
        id: id.to_string(),
        category: TraceCategory::TaskExecution,
        description: format!("{id} decision"),
        decision: "do the thing".to_string(),
        outcome,
        context: json!({}),
        project_path: TEST_PROJECT.to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// A failed shell call carrying `message` as its error.
pub fn error_record(task_id: &str, message: &str) -> ExecutionRecord {
    ExecutionRecord {
        task_id: task_id.to_string(),
        project_path: TEST_PROJECT.to_string(),
        tool_name: "bash".to_string(),
        input: "make check".to_string(),
        output: message.to_string(),
        exit_code: Some(1),
        error: Some(message.to_string()),
        files_touched: Vec::new(),
        timestamp: Utc::now(),
    }
}

/// A clean edit of `file`.
pub fn fix_record(task_id: &str, file: &str) -> ExecutionRecord {
    ExecutionRecord {
        task_id: task_id.to_string(),
        project_path: TEST_PROJECT.to_string(),
        tool_name: "edit_file".to_string(),
        input: format!("--- a/{file}\n+++ b/{file}\n"),
        output: "applied".to_string(),
        exit_code: Some(0),
        error: None,
        files_touched: vec![file.to_string()],
        timestamp: Utc::now(),
    }
}

/// A successful read-only call; touches no files.
pub fn read_record(task_id: &str, target: &str) -> ExecutionRecord {
    ExecutionRecord {
        task_id: task_id.to_string(),
        project_path: TEST_PROJECT.to_string(),
        tool_name: "read_file".to_string(),
        input: target.to_string(),
        output: format!("contents of {target}"),
        exit_code: Some(0),
        error: None,
        files_touched: Vec::new(),
        timestamp: Utc::now(),
    }
}

/// A store rooted in a temp directory that lives as long as the fixture.
pub struct TestStore {
    _dir: TempDir,
    store: Arc<MemoryStore>,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::open(dir.path()).expect("open store"));
        Self { _dir: dir, store }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn agent_ok(output: &str) -> AgentResult {
    AgentResult {
        status: RunStatus::Completed,
        output: output.to_string(),
        cost_usd: 0.0,
        turns: 1,
    }
}

pub fn agent_fail(output: &str) -> AgentResult {
    AgentResult {
        status: RunStatus::Failed,
        output: output.to_string(),
        cost_usd: 0.0,
        turns: 1,
    }
}

/// Agent runner replaying a fixed script and recording every prompt it saw.
///
/// Running past the end of the script is an error.
#[derive(Default)]
pub struct ScriptedAgentRunner {
    script: Mutex<VecDeque<AgentResult>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgentRunner {
    pub fn new(script: Vec<AgentResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn run_task(&self, prompt: &str) -> Result<AgentResult> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| anyhow!("agent script exhausted"))
    }
}
