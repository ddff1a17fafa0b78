//! Quality checks run against the worktree when an agent claims completion.
//!
//! `code`-type checks resolve their name through a project command table;
//! `custom` checks run their literal command. Commands run under `sh -c` with
//! a timeout; the tail of combined output is kept for retry context.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::time::timeout;

/// How a check's command is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// `name` maps to a project-specific command.
    Code,
    /// `command` is used verbatim.
    Custom,
}

/// What a failing check does to the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Phase fails unless a follow-up iteration fixes it.
    #[default]
    Block,
    /// Record and accept.
    Warn,
    /// Do not run at all.
    Skip,
}

/// A configured quality check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub kind: CheckKind,
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Per-check timeout override, seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl QualityCheck {
    pub fn code(name: &str) -> Self {
        Self {
            kind: CheckKind::Code,
            name: name.to_string(),
            command: None,
            failure_mode: FailureMode::Block,
            timeout_secs: None,
        }
    }

    pub fn custom(name: &str, command: &str) -> Self {
        Self {
            kind: CheckKind::Custom,
            name: name.to_string(),
            command: Some(command.to_string()),
            failure_mode: FailureMode::Block,
            timeout_secs: None,
        }
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }
}

/// Result of running one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub exit_code: i32,
    pub passed: bool,
    /// Tail of combined stdout + stderr.
    pub tail: String,
}

#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, check: &QualityCheck, workdir: &Path) -> Result<CheckOutcome>;
}

/// Keep the last `limit` bytes of `text`, on a char boundary.
pub fn tail_of(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Shell-based check runner.
pub struct CommandCheckRunner {
    /// Project command table for `code`-type checks (e.g. "tests" -> "cargo test").
    commands: HashMap<String, String>,
    default_timeout: Duration,
    tail_bytes: usize,
}

impl CommandCheckRunner {
    pub fn new(commands: HashMap<String, String>) -> Self {
        Self {
            commands,
            default_timeout: Duration::from_secs(300),
            tail_bytes: 2000,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn resolve<'a>(&'a self, check: &'a QualityCheck) -> Result<&'a str> {
        match check.kind {
            CheckKind::Custom => check
                .command
                .as_deref()
                .context("Custom check has no command"),
            CheckKind::Code => self
                .commands
                .get(&check.name)
                .map(String::as_str)
                .with_context(|| format!("No project command configured for check '{}'", check.name)),
        }
    }
}

#[async_trait]
impl CheckRunner for CommandCheckRunner {
    async fn run(&self, check: &QualityCheck, workdir: &Path) -> Result<CheckOutcome> {
        let command = self.resolve(check)?;
        let limit = check
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn check command: {}", command))?;

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for check command")?,
            Err(_) => {
                return Ok(CheckOutcome {
                    name: check.name.clone(),
                    exit_code: -1,
                    passed: false,
                    tail: format!("check timed out after {}s", limit.as_secs()),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CheckOutcome {
            name: check.name.clone(),
            exit_code,
            passed: output.status.success(),
            tail: tail_of(&combined, self.tail_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner_with(name: &str, command: &str) -> CommandCheckRunner {
        let mut commands = HashMap::new();
        commands.insert(name.to_string(), command.to_string());
        CommandCheckRunner::new(commands)
    }

    #[tokio::test]
    async fn test_custom_check_passes() {
        let dir = tempdir().unwrap();
        let runner = CommandCheckRunner::new(HashMap::new());
        let check = QualityCheck::custom("noop", "exit 0");

        let outcome = runner.run(&check, dir.path()).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_failing_check_captures_tail() {
        let dir = tempdir().unwrap();
        let runner = CommandCheckRunner::new(HashMap::new());
        let check = QualityCheck::custom("tests", "echo '3 failures'; exit 1");

        let outcome = runner.run(&check, dir.path()).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.tail.contains("3 failures"));
    }

    #[tokio::test]
    async fn test_code_check_resolves_through_table() {
        let dir = tempdir().unwrap();
        let runner = runner_with("tests", "echo resolved; exit 0");
        let check = QualityCheck::code("tests");

        let outcome = runner.run(&check, dir.path()).await.unwrap();
        assert!(outcome.passed);
        assert!(outcome.tail.contains("resolved"));
    }

    #[tokio::test]
    async fn test_unresolved_code_check_is_an_error() {
        let dir = tempdir().unwrap();
        let runner = CommandCheckRunner::new(HashMap::new());
        let check = QualityCheck::code("lint");

        assert!(runner.run(&check, dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_check_timeout() {
        let dir = tempdir().unwrap();
        let runner =
            CommandCheckRunner::new(HashMap::new()).with_default_timeout(Duration::from_millis(100));
        let check = QualityCheck::custom("slow", "sleep 5");

        let outcome = runner.run(&check, dir.path()).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.tail.contains("timed out"));
    }

    #[test]
    fn test_tail_of_truncates_from_front() {
        assert_eq!(tail_of("abcdef", 3), "def");
        assert_eq!(tail_of("ab", 10), "ab");
    }

    #[test]
    fn test_failure_mode_default_is_block() {
        assert_eq!(QualityCheck::code("tests").failure_mode, FailureMode::Block);
        let warn = QualityCheck::code("lint").with_failure_mode(FailureMode::Warn);
        assert_eq!(warn.failure_mode, FailureMode::Warn);
    }
}
