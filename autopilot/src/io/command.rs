//! Command Executor collaborator.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;

/// Exit code reported for commands killed by the timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait CommandExecutor: Send + Sync {
    fn run(&self, command: &str) -> Result<CommandOutcome>;
}

/// Runs commands through `sh -c` inside a working directory.
#[derive(Debug, Clone)]
pub struct ShellCommandExecutor {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ShellCommandExecutor {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
        }
    }
}

impl CommandExecutor for ShellCommandExecutor {
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    fn run(&self, command: &str) -> Result<CommandOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run shell command `{command}`"))?;
        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            // Killed by a signal: report a generic failure.
            output.status.code().unwrap_or(-1)
        };
        debug!(exit_code, "shell command finished");
        Ok(CommandOutcome {
            exit_code,
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let exec = ShellCommandExecutor::new(temp.path(), Duration::from_secs(10), 4096);
        let outcome = exec.run("ls").expect("run");
        assert!(outcome.success());
        assert!(outcome.stdout.contains("marker.txt"));
    }

    #[test]
    fn reports_timeout_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = ShellCommandExecutor::new(temp.path(), Duration::from_millis(100), 4096);
        let outcome = exec.run("sleep 5").expect("run");
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
    }
}
