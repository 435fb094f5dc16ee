//! Prompt rendering for the harness phases.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`;
//! when a rendered prompt exceeds the byte budget, droppable sections go
//! first and the last remaining section is truncated as a final resort.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::features::Feature;
use crate::core::hashing::truncate_at_char_boundary;
use crate::core::recommend::{Recommendation, RecommendationAction};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const TEST_TEMPLATE: &str = include_str!("prompts/test.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Least important first.
const DROP_ORDER: [&str; 4] = ["learnings", "failure", "files", "precedent"];
const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap());

/// Precedent guidance injected into implement prompts.
#[derive(Debug, Clone, Serialize)]
pub struct PrecedentGuidance {
    pub action: &'static str,
    pub description: String,
    pub decision: String,
    pub confidence: String,
}

impl PrecedentGuidance {
    /// Guidance for `use`/`verify` recommendations; nothing for `new_decision`.
    pub fn from_recommendation(rec: &Recommendation) -> Option<Self> {
        if rec.action == RecommendationAction::NewDecision {
            return None;
        }
        let result = rec.trace.as_ref()?;
        Some(Self {
            action: rec.action.as_str(),
            description: result.trace.description.clone(),
            decision: result.trace.decision.clone(),
            confidence: format!("{:.2}", result.confidence),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImplementPrompt<'a> {
    pub project: &'a str,
    pub feature: &'a Feature,
    pub precedent: Option<PrecedentGuidance>,
    pub attempt: u32,
    pub previous_failure: Option<&'a str>,
    pub learnings: &'a [String],
}

#[derive(Debug, Clone)]
pub struct TestPrompt<'a> {
    pub project: &'a str,
    pub features: &'a [Feature],
    pub attempt: u32,
    pub previous_failure: Option<&'a str>,
}

/// A single task outside the harness loop.
#[derive(Debug, Clone)]
pub struct TaskPrompt<'a> {
    pub project: &'a str,
    pub task: &'a str,
    pub files: &'a [String],
    pub precedent: Option<PrecedentGuidance>,
    pub learnings: &'a [String],
}

pub struct PromptRenderer {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptRenderer {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .expect("implement template should be valid");
        env.add_template("test", TEST_TEMPLATE)
            .expect("test template should be valid");
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        Self { env, budget_bytes }
    }

    pub fn render_plan(&self, project: &str, goal: &str, learnings: &[String]) -> Result<String> {
        let rendered = self.env.get_template("plan")?.render(context! {
            project => project,
            goal => goal.trim(),
            learnings => learnings,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_implement(&self, input: &ImplementPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("implement")?.render(context! {
            project => input.project,
            feature => input.feature,
            precedent => input.precedent,
            attempt => input.attempt,
            failure => non_blank(input.previous_failure),
            learnings => input.learnings,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_test(&self, input: &TestPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("test")?.render(context! {
            project => input.project,
            features => input.features,
            attempt => input.attempt,
            failure => non_blank(input.previous_failure),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_task(&self, input: &TaskPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("task")?.render(context! {
            project => input.project,
            task => input.task.trim(),
            files => input.files,
            precedent => input.precedent,
            learnings => input.learnings,
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
    if total(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other: usize = rest.iter().map(|s| s.content.len()).sum();
    let allowed = budget.saturating_sub(other);
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        let keep =
            truncate_at_char_boundary(&last.content, allowed - TRUNCATION_MARKER.len()).len();
        last.content.truncate(keep);
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        let keep = truncate_at_char_boundary(&last.content, allowed).len();
        last.content.truncate(keep);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recommend::TraceResult;
    use crate::core::types::TraceOutcome;
    use crate::test_support::{feature, trace};

    #[test]
    fn plan_prompt_carries_goal_and_json_contract() {
        let renderer = PromptRenderer::new(10_000);
        let prompt = renderer
            .render_plan("/work/app", "Add a login page", &[])
            .expect("render");
        assert!(prompt.contains("<goal>\nAdd a login page\n</goal>"));
        assert!(prompt.contains("\"subtasks\""));
        assert!(!prompt.contains("Known Fixes"));
    }

    /// Sections keep template order: contract, feature, precedent, failure.
    #[test]
    fn implement_prompt_orders_sections() {
        let mut f = feature("F2", 1, &["F1"]);
        f.acceptance_criteria = vec!["login form renders".to_string()];
        let rec = Recommendation {
            action: RecommendationAction::Verify,
            trace: Some(TraceResult {
                trace: trace("dt-4", TraceOutcome::Success),
                confidence: 0.7,
            }),
            reason: String::new(),
        };
        let prompt = PromptRenderer::new(10_000)
            .render_implement(&ImplementPrompt {
                project: "/work/app",
                feature: &f,
                precedent: PrecedentGuidance::from_recommendation(&rec),
                attempt: 1,
                previous_failure: Some("compile error"),
                learnings: &[],
            })
            .expect("render");
        let contract = prompt.find("### Implementation Contract").expect("contract");
        let feature_pos = prompt.find("id: F2").expect("feature");
        let precedent = prompt.find("Verify it fits").expect("precedent");
        let failure = prompt.find("compile error").expect("failure");
        assert!(contract < feature_pos && feature_pos < precedent && precedent < failure);
        assert!(prompt.contains("- login form renders"));
    }

    #[test]
    fn new_decision_injects_no_precedent() {
        let rec = Recommendation {
            action: RecommendationAction::NewDecision,
            trace: None,
            reason: String::new(),
        };
        assert!(PrecedentGuidance::from_recommendation(&rec).is_none());
    }

    #[test]
    fn budget_drops_learnings_before_failure() {
        let f = feature("F1", 1, &[]);
        let learnings = vec!["x".repeat(2_000)];
        let prompt = PromptRenderer::new(1_200)
            .render_implement(&ImplementPrompt {
                project: "/work/app",
                feature: &f,
                precedent: None,
                attempt: 2,
                previous_failure: Some("tests failed"),
                learnings: &learnings,
            })
            .expect("render");
        assert!(!prompt.contains("Known Fixes"));
        assert!(prompt.contains("tests failed"));
        assert!(prompt.contains("### Feature"));
    }

    #[test]
    fn task_prompt_drops_file_list_before_precedent() {
        let files: Vec<String> = (0..200).map(|i| format!("src/module_{i}.rs")).collect();
        let rec = Recommendation {
            action: RecommendationAction::Use,
            trace: Some(TraceResult {
                trace: trace("dt-1", TraceOutcome::Success),
                confidence: 0.9,
            }),
            reason: String::new(),
        };
        let prompt = PromptRenderer::new(1_000)
            .render_task(&TaskPrompt {
                project: "/work/app",
                task: "rename the config loader",
                files: &files,
                precedent: PrecedentGuidance::from_recommendation(&rec),
                learnings: &[],
            })
            .expect("render");
        assert!(prompt.contains("<task>\nrename the config loader\n</task>"));
        assert!(!prompt.contains("Relevant Files"));
        assert!(prompt.contains("Reuse it:"));
    }

    #[test]
    fn oversized_required_section_is_truncated() {
        let mut f = feature("F1", 1, &[]);
        f.description = "é".repeat(5_000);
        let features = vec![f];
        let prompt = PromptRenderer::new(1_000)
            .render_test(&TestPrompt {
                project: "/work/app",
                features: &features,
                attempt: 1,
                previous_failure: None,
            })
            .expect("render");
        assert!(prompt.len() <= 1_002);
        assert!(prompt.ends_with("[truncated]"));
    }
}
