//! Worker pool bookkeeping.
//!
//! Tracks at most one worker per task identifier, carries each worker's
//! cancellation token, and supports idempotent reaping (the orchestrator and
//! a self-removing worker may race).

use crate::worker::WorkerStatus;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bookkeeping for one spawned worker.
pub struct WorkerRecord {
    pub task_id: String,
    pub status: WorkerStatus,
    pub last_error: Option<String>,
    pub cancel: CancellationToken,
    pub handle: Option<JoinHandle<()>>,
}

impl WorkerRecord {
    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Starting | WorkerStatus::Running)
    }
}

/// Map of live workers keyed by task id.
#[derive(Default)]
pub struct WorkerPool {
    inner: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spawned worker. Refuses a second worker for a task that
    /// still has an active one.
    pub fn register(
        &self,
        task_id: &str,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.get(task_id).is_some_and(|r| r.is_active()) {
            return false;
        }
        inner.insert(
            task_id.to_string(),
            WorkerRecord {
                task_id: task_id.to_string(),
                status: WorkerStatus::Starting,
                last_error: None,
                cancel,
                handle: Some(handle),
            },
        );
        true
    }

    pub fn set_status(&self, task_id: &str, status: WorkerStatus, error: Option<String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = inner.get_mut(task_id) {
            record.status = status;
            if error.is_some() {
                record.last_error = error;
            }
        }
    }

    /// Remove a worker record. Idempotent: reaping an absent id is a no-op.
    pub fn reap(&self, task_id: &str) -> Option<WorkerRecord> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(task_id)
    }

    /// Number of workers occupying capacity (starting or running).
    pub fn active_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.values().filter(|r| r.is_active()).count()
    }

    pub fn has_worker(&self, task_id: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(task_id).is_some_and(|r| r.is_active())
    }

    pub fn status_of(&self, task_id: &str) -> Option<WorkerStatus> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(task_id).map(|r| r.status)
    }

    /// Cancel every live worker.
    pub fn cancel_all(&self) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for record in inner.values() {
            record.cancel.cancel();
        }
    }

    /// Join handles of all workers, consuming them. Used by shutdown.
    pub fn take_handles(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .values_mut()
            .filter_map(|r| r.handle.take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn test_register_and_reap() {
        let pool = WorkerPool::new();
        assert!(pool.register("task-1", CancellationToken::new(), dummy_handle()));
        assert!(pool.has_worker("task-1"));
        assert_eq!(pool.active_count(), 1);

        let record = pool.reap("task-1").unwrap();
        assert_eq!(record.task_id, "task-1");
        assert_eq!(pool.active_count(), 0);

        // Idempotent.
        assert!(pool.reap("task-1").is_none());
    }

    #[tokio::test]
    async fn test_at_most_one_active_worker_per_task() {
        let pool = WorkerPool::new();
        assert!(pool.register("task-1", CancellationToken::new(), dummy_handle()));
        assert!(!pool.register("task-1", CancellationToken::new(), dummy_handle()));

        // A finished worker can be replaced.
        pool.set_status("task-1", WorkerStatus::Complete, None);
        assert!(pool.register("task-1", CancellationToken::new(), dummy_handle()));
    }

    #[tokio::test]
    async fn test_terminal_workers_free_capacity() {
        let pool = WorkerPool::new();
        pool.register("task-1", CancellationToken::new(), dummy_handle());
        pool.register("task-2", CancellationToken::new(), dummy_handle());
        assert_eq!(pool.active_count(), 2);

        pool.set_status("task-1", WorkerStatus::Failed, Some("boom".into()));
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.status_of("task-1"), Some(WorkerStatus::Failed));

        let record = pool.reap("task-1").unwrap();
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancel_all_fires_tokens() {
        let pool = WorkerPool::new();
        let token = CancellationToken::new();
        pool.register("task-1", token.clone(), dummy_handle());

        pool.cancel_all();
        assert!(token.is_cancelled());
    }
}
