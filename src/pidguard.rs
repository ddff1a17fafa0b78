//! Same-user double-run protection.
//!
//! A `.orc.pid` file next to the task's worktree holds the owning process id.
//! `check` succeeds when the file is absent or its pid is dead (the stale
//! file is removed); a live pid yields `AlreadyRunning`. The guard is active
//! in all coordination modes and is always taken before the filesystem lock.

use crate::errors::GuardError;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

pub const PID_FILE_NAME: &str = ".orc.pid";

/// Whether a process with this pid is currently alive.
pub fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Guard file for one worktree.
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn for_worktree(worktree: impl AsRef<Path>) -> Self {
        Self {
            path: worktree.as_ref().join(PID_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Succeeds if no live process holds the guard. Stale files (dead pid or
    /// unparseable content) are removed on the way.
    pub fn check(&self) -> Result<(), GuardError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(GuardError::Io(e)),
        };

        match text.trim().parse::<u32>() {
            Ok(pid) if pid_alive(pid) => Err(GuardError::AlreadyRunning { pid }),
            _ => {
                // Dead pid or garbage: stale, clean it up.
                match std::fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(GuardError::Io(e)),
                }
            }
        }
    }

    /// Check, then record the current process id.
    pub fn acquire(&self) -> Result<(), GuardError> {
        self.check()?;
        std::fs::write(&self.path, format!("{}\n", std::process::id()))?;
        Ok(())
    }

    /// Remove the guard file. Idempotent.
    pub fn release(&self) -> Result<(), GuardError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GuardError::Io(e)),
        }
    }
}
