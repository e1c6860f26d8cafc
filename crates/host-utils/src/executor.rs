//! Command Executor
//!
//! Every interaction with the host (volume manager, target CLI, DHCP service,
//! network tools) goes through an [`Executor`]. In production this is a
//! [`HostExecutor`]; tests substitute a scripted fake.

use async_trait::async_trait;
use nsboot_common::Error;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default bound on a single external command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start command '{command}': {err}")]
    Spawn {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("Command '{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' failed with status {}", display_status(.status))]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

fn display_status(status: &Option<i32>) -> String {
    status
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl ExecutionError {
    pub fn failure(command: impl Into<String>, output: &CommandOutput) -> Self {
        ExecutionError::CommandFailure {
            command: command.into(),
            status: output.status,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        }
    }

    /// Everything the command printed, for diagnostics.
    pub fn output(&self) -> String {
        match self {
            ExecutionError::CommandFailure { stdout, stderr, .. } => CommandOutput {
                status: None,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }
            .combined(),
            _ => String::new(),
        }
    }
}

impl From<ExecutionError> for Error {
    fn from(err: ExecutionError) -> Self {
        let output = err.output();
        Error::Collaborator {
            message: err.to_string(),
            output,
        }
    }
}

/// Render a command line for logs and error messages.
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shared handle to an executor.
pub type BoxedExecutor = Arc<dyn Executor>;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command to completion and return its output regardless of exit
    /// status. Only spawn failures and timeouts are errors.
    async fn execute_unchecked(
        &self,
        program: &str,
        args: &[&str],
        privileged: bool,
    ) -> Result<CommandOutput, ExecutionError>;

    /// Run a command to completion; a non-zero exit is an error.
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        privileged: bool,
    ) -> Result<CommandOutput, ExecutionError> {
        let output = self.execute_unchecked(program, args, privileged).await?;
        if !output.success() {
            return Err(ExecutionError::failure(command_line(program, args), &output));
        }
        Ok(output)
    }
}

/// Runs commands on the local host through `tokio::process`.
pub struct HostExecutor {
    sudo: Option<PathBuf>,
    timeout: Duration,
    counter: AtomicU64,
}

impl HostExecutor {
    /// `sudo` is prefixed to privileged commands when set.
    pub fn new(sudo: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            sudo,
            timeout,
            counter: AtomicU64::new(0),
        }
    }

    pub fn as_executor(self) -> BoxedExecutor {
        Arc::new(self)
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new(Some(PathBuf::from("/usr/bin/sudo")), DEFAULT_TIMEOUT)
    }
}

pub(crate) fn log_output(id: u64, command: &str, output: &CommandOutput) {
    info!(
        id,
        result = if output.success() { "OK" } else { "ERROR" },
        status = %display_status(&output.status),
        "finished running command"
    );
    if !output.stdout.is_empty() {
        debug!(id, stdout = %output.stdout.trim_end(), "command stdout");
    }
    if !output.stderr.is_empty() {
        debug!(id, stderr = %output.stderr.trim_end(), "command stderr");
    }
    if !output.success() {
        warn!(id, command, output = %output.combined(), "command exited unsuccessfully");
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_unchecked(
        &self,
        program: &str,
        args: &[&str],
        privileged: bool,
    ) -> Result<CommandOutput, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let line = command_line(program, args);

        let mut command = match (&self.sudo, privileged) {
            (Some(sudo), true) => {
                let mut command = tokio::process::Command::new(sudo);
                command.arg(program);
                command
            }
            _ => tokio::process::Command::new(program),
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(id, command = %line, privileged, "running command");

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                error!(id, command = %line, error = %err, "failed to spawn command");
                return Err(ExecutionError::Spawn { command: line, err });
            }
            Err(_) => {
                error!(id, command = %line, timeout = ?self.timeout, "command timed out");
                return Err(ExecutionError::Timeout {
                    command: line,
                    timeout: self.timeout,
                });
            }
        };

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        log_output(id, &line, &output);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("zfs", &["clone", "a@b", "c"]),
            "zfs clone a@b c"
        );
    }

    #[test]
    fn test_failure_converts_to_collaborator_error() {
        let output = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "cannot open 'nsboot0/x': dataset does not exist\n".to_string(),
        };
        let err: Error = ExecutionError::failure("zfs destroy nsboot0/x", &output).into();
        match err {
            Error::Collaborator { message, output } => {
                assert_eq!(message, "Command 'zfs destroy nsboot0/x' failed with status 1");
                assert_eq!(output, "cannot open 'nsboot0/x': dataset does not exist");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_executor_captures_output() {
        let executor = HostExecutor::new(None, DEFAULT_TIMEOUT);
        let output = executor
            .execute("sh", &["-c", "echo out; echo err >&2"], true)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.combined(), "out\nerr");
    }

    #[tokio::test]
    async fn test_host_executor_non_zero_exit() {
        let executor = HostExecutor::new(None, DEFAULT_TIMEOUT);

        let output = executor
            .execute_unchecked("sh", &["-c", "exit 3"], false)
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));

        let err = executor
            .execute("sh", &["-c", "echo boom >&2; exit 3"], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CommandFailure { status: Some(3), .. }));
        assert_eq!(err.output(), "boom");
    }

    #[tokio::test]
    async fn test_host_executor_timeout() {
        let executor = HostExecutor::new(None, Duration::from_millis(100));
        let err = executor
            .execute("sleep", &["5"], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_host_executor_spawn_failure() {
        let executor = HostExecutor::new(None, DEFAULT_TIMEOUT);
        let err = executor
            .execute("/nonexistent/binary", &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }
}
