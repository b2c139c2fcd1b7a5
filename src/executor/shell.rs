//! Subprocess execution for `shell` and `git` requests.
//!
//! Provides controlled command execution with:
//! - Working directory confined to the workspace
//! - Timeout enforcement (the child is killed on expiry)
//! - Output capture and truncation
//! - Blocked command patterns for safety

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecutorError;

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Commands that are always blocked.
static BLOCKED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:", // Fork bomb
        "dd if=/dev/zero",
        "mkfs",
        "chmod -r 777 /",
        "> /dev/sda",
        "curl | sh",
        "wget | sh",
        "curl | bash",
        "wget | bash",
    ])
});

/// Patterns that indicate potentially dangerous commands.
static DANGEROUS_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "sudo ",
        "doas ",
        " | sh",
        " | bash",
        " | zsh",
        "eval ",
        "$(curl",
        "$(wget",
        "/etc/passwd",
        "/etc/shadow",
        "~/.ssh",
        ".bash_history",
        "id_rsa",
    ]
});

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i64,
    pub success: bool,
}

/// Runs subprocesses inside the workspace.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    working_dir: PathBuf,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Check if a command is blocked.
    fn is_blocked(cmd: &str) -> Option<&'static str> {
        let normalized = cmd.to_lowercase();

        if BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b)) {
            return Some("Command contains blocked pattern");
        }
        if DANGEROUS_PATTERNS.iter().any(|p| normalized.contains(p)) {
            return Some("Command contains potentially dangerous pattern");
        }
        None
    }

    /// Run `cmd` through the platform shell. `cwd` must already be resolved
    /// inside the workspace.
    pub async fn run_shell(
        &self,
        cmd: &str,
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecutorError> {
        if let Some(reason) = Self::is_blocked(cmd) {
            return Err(ExecutorError::NotAuthorized(format!(
                "{}: {}",
                reason,
                truncate_for_error(cmd)
            )));
        }

        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        };
        command.current_dir(cwd.unwrap_or(&self.working_dir));
        self.run("shell", command, timeout.unwrap_or(self.timeout))
            .await
    }

    /// Run `git <args>` without a shell in `repo`.
    pub async fn run_git(&self, args: &[String], repo: &Path) -> Result<CommandOutput, ExecutorError> {
        let mut command = Command::new("git");
        command.args(args).current_dir(repo);
        self.run("git", command, self.timeout).await
    }

    async fn run(
        &self,
        op: &str,
        mut command: Command,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| ExecutorError::Failed {
            op: op.to_string(),
            reason: format!("Failed to spawn command: {e}"),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecutorError::Failed {
                    op: op.to_string(),
                    reason: format!("Command execution failed: {e}"),
                });
            }
            Err(_) => {
                return Err(ExecutorError::Timeout {
                    op: op.to_string(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        let exit_code = output.status.code().unwrap_or(-1) as i64;
        debug!(op, exit_code, "Command finished");
        Ok(CommandOutput {
            output: truncate_output(&combined),
            exit_code,
            success: exit_code == 0,
        })
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Truncate command for error messages.
fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}
