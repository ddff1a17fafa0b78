//! Storage collaborator interface.
//!
//! The backend owns tasks and initiatives; the core reads and mutates through
//! this trait from worker threads. `save_task` is atomic from the core's
//! perspective. Real implementation: the product's persistence layer. Test
//! double and reference: `MemoryStorage`.

use crate::task::{Initiative, Task};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_task(&self, id: &str) -> Result<Option<Task>>;

    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn load_all_tasks(&self) -> Result<Vec<Task>>;

    async fn next_task_id(&self) -> Result<String>;

    async fn load_initiative(&self, id: &str) -> Result<Option<Initiative>>;

    async fn save_initiative(&self, initiative: &Initiative) -> Result<()>;

    async fn next_initiative_id(&self) -> Result<String>;
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    tasks: Mutex<HashMap<String, Task>>,
    initiatives: Mutex<HashMap<String, Initiative>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.get(id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_all_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.values().cloned().collect())
    }

    async fn next_task_id(&self) -> Result<String> {
        Ok(format!("task-{}", Uuid::new_v4().simple()))
    }

    async fn load_initiative(&self, id: &str) -> Result<Option<Initiative>> {
        let initiatives = self.initiatives.lock().unwrap_or_else(|e| e.into_inner());
        Ok(initiatives.get(id).cloned())
    }

    async fn save_initiative(&self, initiative: &Initiative) -> Result<()> {
        let mut initiatives = self.initiatives.lock().unwrap_or_else(|e| e.into_inner());
        initiatives.insert(initiative.id.clone(), initiative.clone());
        Ok(())
    }

    async fn next_initiative_id(&self) -> Result<String> {
        Ok(format!("init-{}", Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;

    #[tokio::test]
    async fn test_save_and_load_task() {
        let storage = MemoryStorage::new();
        let task = Task::new("task-1", "Do the thing", Weight::Small);

        storage.save_task(&task).await.unwrap();
        let loaded = storage.load_task("task-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Do the thing");

        assert!(storage.load_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let storage = MemoryStorage::new();
        let mut task = Task::new("task-1", "Original", Weight::Trivial);
        storage.save_task(&task).await.unwrap();

        task.title = "Updated".into();
        storage.save_task(&task).await.unwrap();

        let loaded = storage.load_task("task-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Updated");
        assert_eq!(storage.load_all_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initiative_roundtrip() {
        let storage = MemoryStorage::new();
        let initiative = Initiative::new("init-1", "Q3 refactor", vec!["task-1".into()]);
        storage.save_initiative(&initiative).await.unwrap();

        let loaded = storage.load_initiative("init-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Q3 refactor");
        assert_eq!(loaded.tasks, vec!["task-1".to_string()]);
    }

    #[tokio::test]
    async fn test_minted_ids_are_unique() {
        let storage = MemoryStorage::new();
        let a = storage.next_task_id().await.unwrap();
        let b = storage.next_task_id().await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("task-"));
    }
}
