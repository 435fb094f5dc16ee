//! Plan documents produced by the planning agent.
//!
//! Agent output is not guaranteed to be well-formed JSON, so extraction tries,
//! in order: the whole text, fenced code blocks, then the span from the first
//! `{` to the last `}`.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::features::{Feature, FeatureStatus};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
const DEFAULT_PHASE: &str = "implementation";

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default)]
    pub goal: Option<String>,
    pub subtasks: Vec<PlanSubtask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSubtask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl PlanDocument {
    /// Materialize pending features; missing priorities follow plan order.
    pub fn to_features(&self) -> Vec<Feature> {
        self.subtasks
            .iter()
            .enumerate()
            .map(|(idx, task)| Feature {
                id: task.id.trim().to_string(),
                description: task.description.trim().to_string(),
                priority: task.priority.unwrap_or(idx as u32 + 1),
                status: FeatureStatus::Pending,
                phase: task
                    .phase
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PHASE.to_string()),
                dependencies: task
                    .dependencies
                    .iter()
                    .map(|d| d.trim().to_string())
                    .collect(),
                acceptance_criteria: task.acceptance_criteria.clone(),
                attempts: 0,
                cost_usd: 0.0,
            })
            .collect()
    }
}

/// Single-feature plan used when the planning agent produced nothing usable.
pub fn fallback_plan(goal: &str) -> PlanDocument {
    let goal = goal.trim();
    let description = if goal.is_empty() {
        "Implement the requested change".to_string()
    } else {
        goal.to_string()
    };
    PlanDocument {
        goal: Some(description.clone()),
        subtasks: vec![PlanSubtask {
            id: "F1".to_string(),
            description,
            priority: Some(1),
            phase: None,
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
        }],
    }
}

/// Find the first JSON object in free-form agent output.
pub fn extract_json_object(text: &str) -> Option<Value> {
    if let Some(value) = parse_object(text.trim()) {
        return Some(value);
    }
    for caps in FENCE_RE.captures_iter(text) {
        if let Some(body) = caps.get(1)
            && let Some(value) = parse_object(body.as_str().trim())
        {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    parse_object(&text[start..=end])
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Extract, schema-check and deserialize a plan from agent output.
pub fn parse_plan(text: &str) -> Result<PlanDocument> {
    let value = extract_json_object(text).ok_or_else(|| anyhow!("no JSON object in plan output"))?;
    let errors = schema_errors(&value)?;
    if !errors.is_empty() {
        return Err(anyhow!("plan schema validation failed: {}", errors.join("; ")));
    }
    serde_json::from_value(value).context("deserialize plan")
}

fn schema_errors(value: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let validator = validator_for(&schema).map_err(|err| anyhow!("invalid plan schema: {err}"))?;
    Ok(validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect())
}
