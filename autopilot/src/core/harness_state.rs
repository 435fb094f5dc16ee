//! Build harness states, transition table and persisted context.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    Start,
    Init,
    Implement,
    Test,
    Complete,
}

impl HarnessState {
    pub fn as_str(self) -> &'static str {
        match self {
            HarnessState::Start => "start",
            HarnessState::Init => "init",
            HarnessState::Implement => "implement",
            HarnessState::Test => "test",
            HarnessState::Complete => "complete",
        }
    }
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `complete` is terminal; `implement` may loop on itself.
pub fn is_allowed_transition(from: HarnessState, to: HarnessState) -> bool {
    use HarnessState::{Complete, Implement, Init, Start, Test};
    matches!(
        (from, to),
        (Start, Init)
            | (Init, Implement)
            | (Implement, Test)
            | (Implement, Implement)
            | (Test, Implement)
            | (Test, Complete)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessTransitionError {
    pub from: HarnessState,
    pub to: HarnessState,
}

impl fmt::Display for HarnessTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal harness transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for HarnessTransitionError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: HarnessState,
    pub to: HarnessState,
    pub timestamp: DateTime<Utc>,
    pub feature_id: Option<String>,
}

/// Resumable harness position for one project (`.autopilot/harness.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessContext {
    pub project_path: String,
    pub state: HarnessState,
    pub current_feature: Option<String>,
    /// Harness-level attempt counter for the current phase.
    pub attempts: u32,
    pub history: Vec<TransitionRecord>,
    pub health: String,
    pub session_id: String,
}

impl HarnessContext {
    pub fn new(project_path: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            state: HarnessState::Start,
            current_feature: None,
            attempts: 0,
            history: Vec::new(),
            health: "unchecked".to_string(),
            session_id: session_id.into(),
        }
    }

    /// Validate and apply a transition, appending it to the history.
    pub fn transition(
        &mut self,
        to: HarnessState,
        feature_id: Option<&str>,
    ) -> Result<(), HarnessTransitionError> {
        if !is_allowed_transition(self.state, to) {
            return Err(HarnessTransitionError {
                from: self.state,
                to,
            });
        }
        self.history.push(TransitionRecord {
            from: self.state,
            to,
            timestamp: Utc::now(),
            feature_id: feature_id.map(str::to_string),
        });
        self.state = to;
        Ok(())
    }
}
