//! File-backed persistent store shared by every control-plane component.
//!
//! Keyed tables are pretty JSON documents replaced atomically; the execution
//! log and the cost ledger are append-only JSONL. One mutex serializes all
//! read-modify-write cycles within the process.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::hashing::stable_hash;
use crate::core::trust::TrustScore;
use crate::core::types::{
    CostEvent, DecisionTrace, ExecutionRecord, Learning, SkillCandidate, TraceCategory,
    TraceOutcome,
};
use crate::io::atomic::write_json;

const TRUST_TABLE: &str = "trust.json";
const LEARNINGS_TABLE: &str = "learnings.json";
const SKILLS_TABLE: &str = "skills.json";
const TRACES_TABLE: &str = "traces.json";
const DOCUMENTS_TABLE: &str = "documents.json";
const LEARNED_TASKS_TABLE: &str = "learned_tasks.json";
const LEDGER_FILE: &str = "ledger.jsonl";
const EXECUTIONS_DIR: &str = "executions";

#[derive(Debug, Default, Serialize, Deserialize)]
struct TraceTable {
    next_id: u64,
    traces: Vec<DecisionTrace>,
}

#[derive(Debug)]
pub struct MemoryStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl MemoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(EXECUTIONS_DIR))
            .with_context(|| format!("create store {}", root.display()))?;
        debug!(root = %root.display(), "memory store opened");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn read_table<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.root.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Read-modify-write one table under the store lock.
    ///
    /// The table is only written back when `f` succeeds.
    fn with_table<T, R>(&self, name: &str, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _guard = self.guard()?;
        let mut table: T = self.read_table(name)?;
        let out = f(&mut table)?;
        write_json(&self.root.join(name), &table)?;
        Ok(out)
    }

    fn snapshot<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let _guard = self.guard()?;
        self.read_table(name)
    }

    // Trust

    pub fn trust(&self, project: &str) -> Result<Option<TrustScore>> {
        let table: BTreeMap<String, TrustScore> = self.snapshot(TRUST_TABLE)?;
        Ok(table.get(project).cloned())
    }

    /// Mutate a project's score, creating it at tier 0 on first use.
    pub fn update_trust<R>(
        &self,
        project: &str,
        f: impl FnOnce(&mut TrustScore) -> Result<R>,
    ) -> Result<R> {
        self.with_table(TRUST_TABLE, |table: &mut BTreeMap<String, TrustScore>| {
            let score = table
                .entry(project.to_string())
                .or_insert_with(|| TrustScore::new(project));
            f(score)
        })
    }

    // Learnings

    pub fn learnings(&self) -> Result<Vec<Learning>> {
        self.snapshot(LEARNINGS_TABLE)
    }

    pub fn learning(&self, project: &str, pattern_hash: &str) -> Result<Option<Learning>> {
        Ok(self
            .learnings()?
            .into_iter()
            .find(|l| l.project_path == project && l.error_pattern_hash == pattern_hash))
    }

    pub fn learnings_for_project(&self, project: &str) -> Result<Vec<Learning>> {
        Ok(self
            .learnings()?
            .into_iter()
            .filter(|l| l.project_path == project)
            .collect())
    }

    pub fn learnings_needing_revalidation(&self) -> Result<Vec<Learning>> {
        Ok(self
            .learnings()?
            .into_iter()
            .filter(|l| l.needs_revalidation)
            .collect())
    }

    pub fn update_learnings<R>(
        &self,
        f: impl FnOnce(&mut Vec<Learning>) -> Result<R>,
    ) -> Result<R> {
        self.with_table(LEARNINGS_TABLE, f)
    }

    // Skill candidates

    pub fn skills(&self) -> Result<Vec<SkillCandidate>> {
        let table: BTreeMap<String, SkillCandidate> = self.snapshot(SKILLS_TABLE)?;
        Ok(table.into_values().collect())
    }

    pub fn skill(&self, pattern_hash: &str) -> Result<Option<SkillCandidate>> {
        let table: BTreeMap<String, SkillCandidate> = self.snapshot(SKILLS_TABLE)?;
        Ok(table.get(pattern_hash).cloned())
    }

    pub fn update_skills<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, SkillCandidate>) -> Result<R>,
    ) -> Result<R> {
        self.with_table(SKILLS_TABLE, f)
    }

    // Decision traces

    /// Allocate the next `dt-N` id and store the trace `build` returns for it.
    pub fn insert_trace(&self, build: impl FnOnce(String) -> DecisionTrace) -> Result<String> {
        self.with_table(TRACES_TABLE, |table: &mut TraceTable| {
            table.next_id += 1;
            let trace = build(format!("dt-{}", table.next_id));
            let id = trace.id.clone();
            table.traces.push(trace);
            Ok(id)
        })
    }

    pub fn update_trace_outcome(
        &self,
        id: &str,
        outcome: TraceOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.with_table(TRACES_TABLE, |table: &mut TraceTable| {
            let trace = table
                .traces
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| anyhow!("unknown decision trace {id}"))?;
            trace.outcome = outcome;
            trace.updated_at = now;
            Ok(())
        })
    }

    pub fn trace(&self, id: &str) -> Result<Option<DecisionTrace>> {
        let table: TraceTable = self.snapshot(TRACES_TABLE)?;
        Ok(table.traces.into_iter().find(|t| t.id == id))
    }

    pub fn traces_by_category(&self, category: TraceCategory) -> Result<Vec<DecisionTrace>> {
        let table: TraceTable = self.snapshot(TRACES_TABLE)?;
        Ok(table
            .traces
            .into_iter()
            .filter(|t| t.category == category)
            .collect())
    }

    pub fn traces(&self) -> Result<Vec<DecisionTrace>> {
        let table: TraceTable = self.snapshot(TRACES_TABLE)?;
        Ok(table.traces)
    }

    // Derived documents (context metadata, capabilities, reports)

    pub fn document(&self, key: &str) -> Result<Option<Value>> {
        let table: BTreeMap<String, Value> = self.snapshot(DOCUMENTS_TABLE)?;
        Ok(table.get(key).cloned())
    }

    pub fn put_document(&self, key: &str, value: Value) -> Result<()> {
        self.with_table(DOCUMENTS_TABLE, |table: &mut BTreeMap<String, Value>| {
            table.insert(key.to_string(), value);
            Ok(())
        })
    }

    // Mined task ids

    pub fn is_task_learned(&self, task_id: &str) -> Result<bool> {
        let table: BTreeSet<String> = self.snapshot(LEARNED_TASKS_TABLE)?;
        Ok(table.contains(task_id))
    }

    pub fn mark_task_learned(&self, task_id: &str) -> Result<()> {
        self.with_table(LEARNED_TASKS_TABLE, |table: &mut BTreeSet<String>| {
            table.insert(task_id.to_string());
            Ok(())
        })
    }

    // Execution log

    pub fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let path = self.execution_path(&record.task_id);
        let _guard = self.guard()?;
        append_jsonl(&path, record)
    }

    pub fn executions(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        let path = self.execution_path(task_id);
        let _guard = self.guard()?;
        let records: Vec<ExecutionRecord> = read_jsonl(&path)?;
        Ok(records
            .into_iter()
            .filter(|record| record.task_id == task_id)
            .collect())
    }

    /// Task ids with at least one logged execution record, sorted.
    pub fn execution_task_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join(EXECUTIONS_DIR);
        let _guard = self.guard()?;
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry.context("read executions entry")?.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            let records: Vec<ExecutionRecord> = read_jsonl(&path)?;
            ids.extend(records.into_iter().map(|record| record.task_id));
        }
        Ok(ids.into_iter().collect())
    }

    fn execution_path(&self, task_id: &str) -> PathBuf {
        self.root
            .join(EXECUTIONS_DIR)
            .join(format!("{}-{}.jsonl", file_safe(task_id), stable_hash(task_id)))
    }

    // Cost ledger

    pub fn append_cost(&self, event: &CostEvent) -> Result<()> {
        let path = self.root.join(LEDGER_FILE);
        let _guard = self.guard()?;
        append_jsonl(&path, event)
    }

    pub fn costs(&self) -> Result<Vec<CostEvent>> {
        let path = self.root.join(LEDGER_FILE);
        let _guard = self.guard()?;
        read_jsonl(&path)
    }

    pub fn costs_on(&self, date: NaiveDate) -> Result<Vec<CostEvent>> {
        Ok(self
            .costs()?
            .into_iter()
            .filter(|event| event.date == date)
            .collect())
    }
}

/// Readable filename stem for `id`; the caller appends a hash to keep distinct ids apart.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("serialize jsonl record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}
