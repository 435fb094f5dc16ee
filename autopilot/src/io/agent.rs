//! Agent Runner collaborator and its CLI-backed implementation.
//!
//! The [`AgentRunner`] trait decouples the harness and orchestrator from the
//! agent backend. Tests use scripted runners that return canned results
//! without spawning processes.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::AgentConfig;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: RunStatus,
    pub output: String,
    pub cost_usd: f64,
    pub turns: u32,
}

impl AgentResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// An adapter failure expressed as an `error` result.
    pub fn adapter_error(err: &anyhow::Error) -> Self {
        Self {
            status: RunStatus::Error,
            output: format!("{err:#}"),
            cost_usd: 0.0,
            turns: 0,
        }
    }
}

/// Executes one prompt to completion.
///
/// Retried by the harness, so implementations must tolerate repeated calls
/// with the same prompt.
pub trait AgentRunner: Send + Sync {
    fn run_task(&self, prompt: &str) -> Result<AgentResult>;
}

/// Runs the configured agent CLI with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgentRunner {
    pub workdir: PathBuf,
    pub config: AgentConfig,
}

impl CommandAgentRunner {
    pub fn new(workdir: impl Into<PathBuf>, config: AgentConfig) -> Self {
        Self {
            workdir: workdir.into(),
            config,
        }
    }
}

impl AgentRunner for CommandAgentRunner {
    #[instrument(
        skip_all,
        fields(workdir = %self.workdir.display(), timeout_secs = self.config.timeout_secs)
    )]
    fn run_task(&self, prompt: &str) -> Result<AgentResult> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .context("agent command is empty")?;
        info!(program = %program, "starting agent");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        )
        .with_context(|| format!("run agent {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "agent timed out");
            return Ok(AgentResult {
                status: RunStatus::Error,
                output: format!(
                    "agent timed out after {}s\n{}",
                    self.config.timeout_secs,
                    output.stderr_text()
                ),
                cost_usd: 0.0,
                turns: 0,
            });
        }

        let stdout = output.stdout_text();
        let result = parse_agent_output(&stdout, output.status.success());
        if !result.succeeded() {
            warn!(
                exit_code = ?output.status.code(),
                status = %result.status,
                "agent did not complete"
            );
        }
        debug!(cost_usd = result.cost_usd, turns = result.turns, "agent finished");
        Ok(result)
    }
}

/// Result envelope printed by JSON-mode agent CLIs.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default, alias = "output")]
    result: Option<String>,
    #[serde(default, alias = "cost_usd")]
    total_cost_usd: f64,
    #[serde(default, alias = "turns")]
    num_turns: u32,
}

/// Interpret agent stdout; anything that is not a JSON envelope is taken verbatim.
pub fn parse_agent_output(stdout: &str, exited_ok: bool) -> AgentResult {
    let envelope = stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .and_then(|line| serde_json::from_str::<Envelope>(line.trim()).ok())
        .or_else(|| serde_json::from_str::<Envelope>(stdout.trim()).ok());
    match envelope {
        Some(env) => {
            let failed_subtype = env
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));
            let status = if !exited_ok {
                RunStatus::Error
            } else if env.is_error || failed_subtype {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            AgentResult {
                status,
                output: env.result.unwrap_or_default(),
                cost_usd: env.total_cost_usd.max(0.0),
                turns: env.num_turns,
            }
        }
        None => AgentResult {
            status: if exited_ok {
                RunStatus::Completed
            } else {
                RunStatus::Error
            },
            output: stdout.to_string(),
            cost_usd: 0.0,
            turns: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_envelope() {
        let stdout = concat!(
            r#"{"type":"result","subtype":"success","is_error":false,"#,
            r#""result":"done","total_cost_usd":0.42,"num_turns":7}"#,
        );
        let result = parse_agent_output(stdout, true);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, "done");
        assert_eq!(result.cost_usd, 0.42);
        assert_eq!(result.turns, 7);
    }

    #[test]
    fn error_envelope_is_failed() {
        let stdout = concat!(
            r#"{"subtype":"error_max_turns","is_error":true,"#,
            r#""total_cost_usd":1.0,"num_turns":50}"#,
        );
        assert_eq!(parse_agent_output(stdout, true).status, RunStatus::Failed);
    }

    #[test]
    fn plain_text_uses_exit_status() {
        let result = parse_agent_output("all good", true);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, "all good");
        assert_eq!(parse_agent_output("crash", false).status, RunStatus::Error);
    }

    #[cfg(unix)]
    #[test]
    fn command_runner_feeds_prompt_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig {
            command: vec!["cat".to_string()],
            timeout_secs: 10,
            output_limit_bytes: 4096,
        };
        let runner = CommandAgentRunner::new(temp.path(), config);
        let result = runner.run_task("implement F1").expect("run");
        assert!(result.succeeded());
        assert_eq!(result.output, "implement F1");
    }
}
