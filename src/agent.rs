//! Agent subprocess invocation.
//!
//! The agent is an opaque external program: it receives the rendered prompt
//! on stdin, runs inside the task worktree with `ORC_TASK_ID` and `ORC_PHASE`
//! in its environment, and emits text on stdout. The worker reads stdout to
//! end-of-stream; each line is forwarded to the caller for streaming while
//! the full transcript accumulates.
//!
//! Cancellation sends the graceful signal, waits out a short grace window,
//! then hard-kills. Exit status is always collected; no zombies.

use crate::errors::AgentError;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub phase: String,
    pub prompt: String,
    /// Working directory: the task worktree.
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
}

/// Captured result of an invocation.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Full stdout transcript.
    pub output: String,
    pub exit_code: i32,
}

/// Abstraction over agent execution. Real implementation:
/// `SubprocessInvoker`. Tests script it.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run the agent to completion, forwarding each stdout line through
    /// `lines` as it arrives.
    async fn invoke(
        &self,
        req: AgentRequest,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<AgentOutput, AgentError>;
}

/// Spawns the configured agent command as a subprocess.
pub struct SubprocessInvoker {
    command: String,
    args: Vec<String>,
    grace: Duration,
}

impl SubprocessInvoker {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            grace: Duration::from_secs(2),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// SIGTERM, wait out the grace window, SIGKILL. Always reaps.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[async_trait]
impl AgentInvoker for SubprocessInvoker {
    async fn invoke(
        &self,
        req: AgentRequest,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<AgentOutput, AgentError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&req.workdir)
            .env("ORC_TASK_ID", &req.task_id)
            .env("ORC_PHASE", &req.phase)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(AgentError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(req.prompt.as_bytes())
                .await
                .map_err(AgentError::Io)?;
            stdin.shutdown().await.map_err(AgentError::Io)?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Io(std::io::Error::other("missing stdout pipe")))?;
        let mut reader = BufReader::new(stdout).lines();

        let mut transcript = String::new();
        loop {
            tokio::select! {
                _ = req.cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return Err(AgentError::Cancelled);
                }
                line = reader.next_line() => {
                    match line.map_err(AgentError::Io)? {
                        Some(line) => {
                            transcript.push_str(&line);
                            transcript.push('\n');
                            // Receiver gone only means nobody is streaming.
                            let _ = lines.send(line);
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(AgentError::Io)?;
        let exit_code = status.code().unwrap_or(-1);
        debug!(
            task_id = %req.task_id,
            phase = %req.phase,
            exit_code,
            "agent invocation finished"
        );

        Ok(AgentOutput {
            output: transcript,
            exit_code,
        })
    }
}
