//! Shell command execution utilities.
//!
//! This module provides shell command execution with proper quoting to
//! prevent command injection, plus the [`CommandExecutor`] seam the agent
//! uses so that namespace and NAT operations can be recorded instead of
//! executed (tests, dry-run).
//!
//! # Example
//!
//! ```ignore
//! use l3_agent_common::shell::{self, IP_CMD, shellquote};
//!
//! let ns = "qrouter-5c4b3a2f";
//! let cmd = format!("{} netns add {}", IP_CMD, shellquote(ns));
//! let result = shell::exec(&cmd).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{AgentError, AgentResult};

/// Path to the `ip` command for namespace, link, address and route control.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `iptables-restore` command for atomic rule commits.
pub const IPTABLES_RESTORE_CMD: &str = "/sbin/iptables-restore";

/// Path to the `sysctl` command.
pub const SYSCTL_CMD: &str = "/sbin/sysctl";

/// Path to the `ovs-vsctl` command for Open vSwitch port management.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to the `brctl` command for Linux bridge port management.
pub const BRCTL_CMD: &str = "/sbin/brctl";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and the characters with special
/// meaning inside double quotes (`$`, `` ` ``, `"`, `\`, newline) are
/// escaped.
///
/// ```
/// use l3_agent_common::shell::shellquote;
///
/// assert_eq!(shellquote("qrouter-1"), "\"qrouter-1\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Creates a successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Converts a non-zero exit into [`AgentError::ShellCommandFailed`].
    pub fn into_stdout(self, cmd: &str) -> AgentResult<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(AgentError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

fn log_result(cmd: &str, result: &ExecResult) {
    if result.success() {
        tracing::trace!(command = %cmd, exit_code = result.exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }
}

fn spawn_error(cmd: &str, source: std::io::Error) -> AgentError {
    AgentError::ShellExec {
        command: cmd.to_string(),
        source,
    }
}

/// Executes a shell command asynchronously through `/bin/sh -c`.
pub async fn exec(cmd: &str) -> AgentResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| spawn_error(cmd, e))?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    log_result(cmd, &result);
    Ok(result)
}

/// Executes a shell command with `input` written to its stdin.
///
/// Used for `iptables-restore`, which reads the rule payload from stdin.
pub async fn exec_with_input(cmd: &str, input: &str) -> AgentResult<ExecResult> {
    tracing::debug!(command = %cmd, bytes = input.len(), "Executing shell command with input");

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(cmd, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| spawn_error(cmd, e))?;
        // stdin is closed on drop so the child sees EOF
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| spawn_error(cmd, e))?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    log_result(cmd, &result);
    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> AgentResult<String> {
    exec(cmd).await?.into_stdout(cmd)
}

/// Runs shell commands on behalf of the driver and the NAT rule tables.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs a command and returns its result.
    async fn run(&self, cmd: &str) -> AgentResult<ExecResult>;

    /// Runs a command with the given stdin payload.
    async fn run_with_input(&self, cmd: &str, input: &str) -> AgentResult<ExecResult>;

    /// Runs a command and returns stdout, failing on non-zero exit.
    async fn run_or_throw(&self, cmd: &str) -> AgentResult<String> {
        self.run(cmd).await?.into_stdout(cmd)
    }
}

/// Executes commands through `/bin/sh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, cmd: &str) -> AgentResult<ExecResult> {
        exec(cmd).await
    }

    async fn run_with_input(&self, cmd: &str, input: &str) -> AgentResult<ExecResult> {
        exec_with_input(cmd, input).await
    }
}

/// A command captured by [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command: String,
    pub input: Option<String>,
}

#[derive(Debug, Default)]
struct RecordingState {
    commands: Vec<RecordedCommand>,
    responses: Vec<(String, ExecResult)>,
    failures: Vec<String>,
}

/// Records commands instead of executing them.
///
/// Every command succeeds with empty output unless a canned response was
/// registered for a matching prefix with [`with_response`] or the command
/// contains a pattern registered with [`fail_on`].
///
/// [`with_response`]: RecordingExecutor::with_response
/// [`fail_on`]: RecordingExecutor::fail_on
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<RecordingState>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with `result`.
    pub fn with_response(self, prefix: impl Into<String>, result: ExecResult) -> Self {
        self.state.lock().responses.push((prefix.into(), result));
        self
    }

    /// Fails commands containing `pattern` with exit code 1.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state.lock().failures.push(pattern.into());
    }

    /// Removes all failure patterns.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Returns all captured commands.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Returns the captured command lines only.
    pub fn command_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    /// Clears the captured commands.
    pub fn clear(&self) {
        self.state.lock().commands.clear();
    }

    fn record(&self, cmd: &str, input: Option<&str>) -> ExecResult {
        let mut state = self.state.lock();
        state.commands.push(RecordedCommand {
            command: cmd.to_string(),
            input: input.map(str::to_string),
        });
        if state.failures.iter().any(|p| cmd.contains(p.as_str())) {
            return ExecResult::failed(1, "injected failure");
        }
        state
            .responses
            .iter()
            .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, cmd: &str) -> AgentResult<ExecResult> {
        tracing::debug!(command = %cmd, "Recording command");
        Ok(self.record(cmd, None))
    }

    async fn run_with_input(&self, cmd: &str, input: &str) -> AgentResult<ExecResult> {
        tracing::debug!(command = %cmd, "Recording command with input");
        Ok(self.record(cmd, Some(input)))
    }
}
