//! Command Runner: executes external processes with timeout, capture, and
//! strict/non-strict checking.
//!
//! Grounded in the original `run_command` (subprocess.run + timeout +
//! check), ported to `tokio::process` so a timed-out child is actually
//! killed rather than left to run past its deadline -- `tokio::time::timeout`
//! alone would only stop *waiting* on the child, not the child itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::{DeploymentError, Result};

/// A command to execute, either as a pre-tokenized argument vector or as a
/// whitespace-split command string (the Command Runner never invokes a
/// shell, so quoting in the string form is not supported -- callers that
/// need quoting must use `CommandSpec::Tokens`).
#[derive(Debug, Clone)]
pub enum CommandSpec {
    Tokens(Vec<String>),
    Line(String),
}

impl CommandSpec {
    pub fn line(s: impl Into<String>) -> Self {
        CommandSpec::Line(s.into())
    }

    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Tokens(tokens.into_iter().map(Into::into).collect())
    }

    fn argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Tokens(t) => t.clone(),
            CommandSpec::Line(s) => s.split_whitespace().map(str::to_string).collect(),
        }
    }

    fn display(&self) -> String {
        match self {
            CommandSpec::Tokens(t) => t.join(" "),
            CommandSpec::Line(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.rc == 0
    }
}

const STDERR_TRUNCATE_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandRunner {
    working_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run `spec`, failing with `CommandError` if `check` is true and the
    /// process exits non-zero, or `TimeoutError` if it outruns `timeout`.
    pub async fn run(
        &self,
        spec: CommandSpec,
        timeout: Duration,
        check: bool,
    ) -> Result<CommandOutput> {
        let argv = spec.argv();
        let cmd_str = spec.display();

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DeploymentError::Command {
                command: cmd_str.clone(),
                stderr: "empty command".to_string(),
            })?;

        let mut command = Command::new(program);
        command.args(args).current_dir(&self.working_dir);
        command.kill_on_drop(true);

        let spawn_result = tokio::time::timeout(timeout, command.output()).await;

        let output = match spawn_result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DeploymentError::Command {
                    command: cmd_str,
                    stderr: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DeploymentError::Timeout {
                    command: cmd_str,
                    timeout_secs: timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let rc = output.status.code().unwrap_or(-1);

        if check && rc != 0 {
            let truncated: String = stderr.trim().chars().take(STDERR_TRUNCATE_LEN).collect();
            return Err(DeploymentError::Command {
                command: cmd_str,
                stderr: truncated,
            });
        }

        Ok(CommandOutput { rc, stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_successful_command() {
        let runner = CommandRunner::new(".");
        let out = runner
            .run(
                CommandSpec::tokens(["echo", "hello"]),
                Duration::from_secs(5),
                true,
            )
            .await
            .unwrap();
        assert_eq!(out.rc, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn check_true_fails_on_nonzero_exit() {
        let runner = CommandRunner::new(".");
        let err = runner
            .run(
                CommandSpec::tokens(["sh", "-c", "exit 3"]),
                Duration::from_secs(5),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CommandError");
    }

    #[tokio::test]
    async fn check_false_tolerates_nonzero_exit() {
        let runner = CommandRunner::new(".");
        let out = runner
            .run(
                CommandSpec::tokens(["sh", "-c", "exit 7"]),
                Duration::from_secs(5),
                false,
            )
            .await
            .unwrap();
        assert_eq!(out.rc, 7);
    }

    #[tokio::test]
    async fn timeout_is_reported_as_timeout_error() {
        let runner = CommandRunner::new(".");
        let err = runner
            .run(
                CommandSpec::tokens(["sleep", "5"]),
                Duration::from_millis(100),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TimeoutError");
    }

    #[tokio::test]
    async fn parses_whitespace_split_line_form() {
        let runner = CommandRunner::new(".");
        let out = runner
            .run(
                CommandSpec::line("echo hi there"),
                Duration::from_secs(5),
                true,
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi there");
    }
}
