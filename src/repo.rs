//! Repository collaborator interface and the git-worktree implementation.
//!
//! The core never parses git output; it consumes exit statuses and the plain
//! stdout of `rev-parse`. Each task gets an isolated worktree and branch,
//! owned exclusively by one worker for the lifetime of the task.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[async_trait]
pub trait RepoOps: Send + Sync {
    /// Create (or reuse) an isolated working directory for a task.
    async fn create_worktree(&self, task_id: &str) -> Result<PathBuf>;

    /// Remove a task's worktree. With `preserve`, leave it on disk for
    /// debugging and only drop bookkeeping.
    async fn remove_worktree(&self, task_id: &str, preserve: bool) -> Result<()>;

    /// Commit everything in the worktree with the given message.
    async fn commit(&self, worktree: &Path, message: &str) -> Result<()>;

    async fn checkout(&self, branch: &str) -> Result<()>;

    /// Current HEAD commit id of the worktree.
    async fn current_head(&self, worktree: &Path) -> Result<String>;
}

/// `git worktree`-backed repository operations.
pub struct GitWorktrees {
    project_dir: PathBuf,
    worktree_root: PathBuf,
}

impl GitWorktrees {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        let worktree_root = project_dir.join(".worktrees");
        Self {
            project_dir,
            worktree_root,
        }
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktree_root.join(task_id)
    }

    fn branch_name(task_id: &str) -> String {
        format!("orc/{}", task_id)
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .with_context(|| format!("Failed to run git {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {:?} failed: {}", args, stderr.trim());
        }
        Ok(output)
    }
}

#[async_trait]
impl RepoOps for GitWorktrees {
    async fn create_worktree(&self, task_id: &str) -> Result<PathBuf> {
        let path = self.worktree_path(task_id);
        if path.exists() {
            // Resuming a paused or retried task reuses its worktree.
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.worktree_root)
            .await
            .context("Failed to create worktree root")?;

        let branch = Self::branch_name(task_id);
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.git(
            &self.project_dir,
            &["worktree", "add", "-b", &branch, path_str, "HEAD"],
        )
        .await?;
        Ok(path)
    }

    async fn remove_worktree(&self, task_id: &str, preserve: bool) -> Result<()> {
        if preserve {
            return Ok(());
        }
        let path = self.worktree_path(task_id);
        if !path.exists() {
            return Ok(());
        }
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.git(
            &self.project_dir,
            &["worktree", "remove", "--force", path_str],
        )
        .await?;
        Ok(())
    }

    async fn commit(&self, worktree: &Path, message: &str) -> Result<()> {
        self.git(worktree, &["add", "-A"]).await?;
        self.git(worktree, &["commit", "--allow-empty", "-m", message])
            .await?;
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&self.project_dir, &["checkout", branch]).await?;
        Ok(())
    }

    async fn current_head(&self, worktree: &Path) -> Result<String> {
        let output = self.git(worktree, &["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_naming() {
        assert_eq!(GitWorktrees::branch_name("task-7"), "orc/task-7");
    }

    #[test]
    fn test_worktree_path_is_per_task() {
        let repo = GitWorktrees::new("/project");
        assert_eq!(
            repo.worktree_path("task-7"),
            PathBuf::from("/project/.worktrees/task-7")
        );
        assert_ne!(repo.worktree_path("task-7"), repo.worktree_path("task-8"));
    }

    #[tokio::test]
    async fn test_remove_preserve_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitWorktrees::new(dir.path());
        let wt = dir.path().join(".worktrees").join("task-1");
        std::fs::create_dir_all(&wt).unwrap();

        repo.remove_worktree("task-1", true).await.unwrap();
        assert!(wt.exists());
    }

    #[tokio::test]
    async fn test_remove_missing_worktree_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitWorktrees::new(dir.path());
        repo.remove_worktree("ghost", false).await.unwrap();
    }
}
