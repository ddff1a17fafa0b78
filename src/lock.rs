//! Filesystem lock for multi-user coordination.
//!
//! A lock file per task holds `{owner, acquired, heartbeat, ttl, pid}` as
//! key-value text with RFC 3339 UTC timestamps and a compact duration TTL
//! (`60s`). Writes go through a temp file plus rename so readers never see a
//! partial file; a process-local mutex serialises read-modify-write. A lock
//! whose heartbeat is older than its TTL is stale and claimable by anyone.
//!
//! In solo mode every operation is a no-op.

use crate::config::CoordinationMode;
use crate::errors::LockError;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Parsed contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// "user@machine".
    pub owner: String,
    pub acquired: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    pub ttl: Duration,
    pub pid: u32,
}

impl LockRecord {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.heartbeat);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    /// Render to the key-value wire format.
    pub fn render(&self) -> String {
        format!(
            "owner={}\nacquired={}\nheartbeat={}\nttl={}\npid={}\n",
            self.owner,
            self.acquired.to_rfc3339(),
            self.heartbeat.to_rfc3339(),
            format_ttl(self.ttl),
            self.pid
        )
    }

    /// Parse the key-value wire format.
    pub fn parse(text: &str, task_id: &str) -> Result<Self, LockError> {
        let corrupt = |reason: &str| LockError::Corrupt {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        };

        let mut owner = None;
        let mut acquired = None;
        let mut heartbeat = None;
        let mut ttl = None;
        let mut pid = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| corrupt("line without '='"))?;
            match key {
                "owner" => owner = Some(value.to_string()),
                "acquired" => {
                    acquired = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|_| corrupt("bad acquired timestamp"))?
                            .with_timezone(&Utc),
                    )
                }
                "heartbeat" => {
                    heartbeat = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|_| corrupt("bad heartbeat timestamp"))?
                            .with_timezone(&Utc),
                    )
                }
                "ttl" => ttl = Some(parse_ttl(value).ok_or_else(|| corrupt("bad ttl"))?),
                "pid" => pid = Some(value.parse().map_err(|_| corrupt("bad pid"))?),
                _ => {}
            }
        }

        Ok(Self {
            owner: owner.ok_or_else(|| corrupt("missing owner"))?,
            acquired: acquired.ok_or_else(|| corrupt("missing acquired"))?,
            heartbeat: heartbeat.ok_or_else(|| corrupt("missing heartbeat"))?,
            ttl: ttl.ok_or_else(|| corrupt("missing ttl"))?,
            pid: pid.ok_or_else(|| corrupt("missing pid"))?,
        })
    }
}

/// Render a duration in the compact suffix form (`90s`, `2m`, `1h`).
pub fn format_ttl(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Parse the compact suffix form. Bare numbers are seconds.
pub fn parse_ttl(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last()? {
        's' => (&text[..text.len() - 1], 1),
        'm' => (&text[..text.len() - 1], 60),
        'h' => (&text[..text.len() - 1], 3600),
        c if c.is_ascii_digit() => (text, 1),
        _ => return None,
    };
    let value: u64 = digits.parse().ok()?;
    Some(Duration::from_secs(value * multiplier))
}

/// Default owner identity, "user@machine".
pub fn default_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let machine = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", user, machine)
}

/// Per-task filesystem locks with TTL and heartbeat.
pub struct LockManager {
    dir: PathBuf,
    owner: String,
    ttl: Duration,
    mode: CoordinationMode,
    // Serialises read-modify-write within this process.
    io: Mutex<()>,
}

impl LockManager {
    pub fn new(dir: impl AsRef<Path>, owner: &str, ttl: Duration, mode: CoordinationMode) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            owner: owner.to_string(),
            ttl,
            mode,
            io: Mutex::new(()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", task_id))
    }

    fn write_atomic(&self, path: &Path, record: &LockRecord) -> Result<(), LockError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(record.render().as_bytes())?;
        tmp.persist(path).map_err(|e| LockError::Io(e.error))?;
        Ok(())
    }

    fn read(&self, task_id: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.lock_path(task_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => LockRecord::parse(&text, task_id).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Acquire (or refresh) the lock for a task.
    ///
    /// - absent or stale lock: claim it
    /// - corrupt lock file: treated as stale, claimed with a warning
    /// - fresh lock held by this owner: refresh the heartbeat
    /// - fresh lock held by someone else: `LockError::Held`
    pub fn acquire(&self, task_id: &str) -> Result<(), LockError> {
        if self.mode == CoordinationMode::Solo {
            return Ok(());
        }
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());

        let now = Utc::now();
        match self.read(task_id) {
            Ok(Some(existing)) => {
                if existing.owner == self.owner {
                    // Re-acquisition refreshes.
                } else if existing.is_stale(now) {
                    warn!(
                        task_id,
                        previous_owner = %existing.owner,
                        "claiming stale lock"
                    );
                } else {
                    return Err(LockError::Held {
                        owner: existing.owner,
                        task_id: task_id.to_string(),
                    });
                }
            }
            Ok(None) => {}
            Err(LockError::Corrupt { reason, .. }) => {
                warn!(task_id, reason = %reason, "claiming corrupt lock file");
            }
            Err(e) => return Err(e),
        }

        let record = LockRecord {
            owner: self.owner.clone(),
            acquired: now,
            heartbeat: now,
            ttl: self.ttl,
            pid: std::process::id(),
        };
        self.write_atomic(&self.lock_path(task_id), &record)
    }

    /// Rewrite the heartbeat timestamp if this owner still holds the lock.
    pub fn heartbeat(&self, task_id: &str) -> Result<(), LockError> {
        if self.mode == CoordinationMode::Solo {
            return Ok(());
        }
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());

        let Some(mut record) = self.read(task_id)? else {
            return Ok(());
        };
        if record.owner != self.owner {
            return Ok(());
        }
        record.heartbeat = Utc::now();
        self.write_atomic(&self.lock_path(task_id), &record)
    }

    /// Remove the lock file if this owner holds it. Idempotent: a missing
    /// file, a corrupt file, or someone else's lock are all no-ops.
    pub fn release(&self, task_id: &str) -> Result<(), LockError> {
        if self.mode == CoordinationMode::Solo {
            return Ok(());
        }
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());

        match self.read(task_id) {
            Ok(Some(record)) if record.owner == self.owner => {
                match std::fs::remove_file(self.lock_path(task_id)) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(LockError::Io(e)),
                }
            }
            Ok(_) => Ok(()),
            Err(LockError::Corrupt { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Periodically refreshes a held lock's heartbeat until cancelled.
pub struct HeartbeatRunner {
    manager: Arc<LockManager>,
    interval: Duration,
}

impl HeartbeatRunner {
    pub fn new(manager: Arc<LockManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub fn spawn(&self, task_id: &str, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let interval = self.interval;
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = manager.heartbeat(&task_id) {
                            warn!(task_id = %task_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path, owner: &str) -> LockManager {
        LockManager::new(dir, owner, Duration::from_secs(60), CoordinationMode::Peer)
    }

    #[test]
    fn test_record_wire_roundtrip() {
        let record = LockRecord {
            owner: "alice@laptop".into(),
            acquired: Utc::now(),
            heartbeat: Utc::now(),
            ttl: Duration::from_secs(60),
            pid: 1234,
        };
        let rendered = record.render();
        assert!(rendered.contains("owner=alice@laptop"));
        assert!(rendered.contains("ttl=1m"));
        assert!(rendered.contains("pid=1234"));

        let parsed = LockRecord::parse(&rendered, "task-1").unwrap();
        assert_eq!(parsed.owner, record.owner);
        assert_eq!(parsed.ttl, record.ttl);
        assert_eq!(parsed.pid, record.pid);
    }

    #[test]
    fn test_ttl_format_and_parse() {
        assert_eq!(format_ttl(Duration::from_secs(60)), "1m");
        assert_eq!(format_ttl(Duration::from_secs(90)), "90s");
        assert_eq!(format_ttl(Duration::from_secs(7200)), "2h");

        assert_eq!(parse_ttl("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_ttl("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_ttl("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_ttl("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_ttl("soon"), None);
    }

    #[test]
    fn test_parse_rejects_corrupt() {
        assert!(matches!(
            LockRecord::parse("nonsense", "task-1"),
            Err(LockError::Corrupt { .. })
        ));
        assert!(matches!(
            LockRecord::parse("owner=a\nacquired=not-a-date\n", "task-1"),
            Err(LockError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_acquire_and_exclusion() {
        let dir = tempdir().unwrap();
        let alice = manager(dir.path(), "alice@laptop");
        let bob = manager(dir.path(), "bob@desktop");

        alice.acquire("task-1").unwrap();

        let err = bob.acquire("task-1").unwrap_err();
        match err {
            LockError::Held { owner, task_id } => {
                assert_eq!(owner, "alice@laptop");
                assert_eq!(task_id, "task-1");
            }
            other => panic!("Expected Held, got {other:?}"),
        }
    }

    #[test]
    fn test_owner_reacquire_refreshes_heartbeat() {
        let dir = tempdir().unwrap();
        let alice = manager(dir.path(), "alice@laptop");

        alice.acquire("task-1").unwrap();
        let before = alice.read("task-1").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        alice.acquire("task-1").unwrap();
        let after = alice.read("task-1").unwrap().unwrap();

        assert!(after.heartbeat > before.heartbeat);
    }

    #[test]
    fn test_stale_lock_claimable() {
        let dir = tempdir().unwrap();
        let alice = LockManager::new(
            dir.path(),
            "alice@laptop",
            Duration::from_millis(10),
            CoordinationMode::Peer,
        );
        let bob = manager(dir.path(), "bob@desktop");

        alice.acquire("task-1").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        bob.acquire("task-1").unwrap();
        let record = bob.read("task-1").unwrap().unwrap();
        assert_eq!(record.owner, "bob@desktop");
    }

    #[test]
    fn test_release_only_own_lock_and_idempotent() {
        let dir = tempdir().unwrap();
        let alice = manager(dir.path(), "alice@laptop");
        let bob = manager(dir.path(), "bob@desktop");

        alice.acquire("task-1").unwrap();

        // Bob releasing someone else's lock is a no-op.
        bob.release("task-1").unwrap();
        assert!(alice.read("task-1").unwrap().is_some());

        alice.release("task-1").unwrap();
        assert!(alice.read("task-1").unwrap().is_none());

        // Releasing again is fine.
        alice.release("task-1").unwrap();
    }

    #[test]
    fn test_solo_mode_is_noop() {
        let dir = tempdir().unwrap();
        let solo = LockManager::new(
            dir.path(),
            "alice@laptop",
            Duration::from_secs(60),
            CoordinationMode::Solo,
        );
        solo.acquire("task-1").unwrap();
        assert!(!dir.path().join("task-1.lock").exists());
        solo.release("task-1").unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_runner_refreshes_until_cancelled() {
        let dir = tempdir().unwrap();
        let alice = Arc::new(manager(dir.path(), "alice@laptop"));
        alice.acquire("task-1").unwrap();
        let before = alice.read("task-1").unwrap().unwrap();

        let cancel = CancellationToken::new();
        let runner = HeartbeatRunner::new(alice.clone(), Duration::from_millis(10));
        let handle = runner.spawn("task-1", cancel.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        let after = alice.read("task-1").unwrap().unwrap();
        assert!(after.heartbeat > before.heartbeat);
    }
}
