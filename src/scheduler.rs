//! Dependency-aware, priority-ordered task queue.
//!
//! The scheduler performs no I/O: callers register tasks, pull ready ones,
//! and report outcomes. Ready order is priority (critical first), then
//! insertion order. Tasks depending on a failed task stay waiting until the
//! failed task is re-added and completes.

use crate::errors::SchedulerError;
use crate::task::Priority;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Internal state of one registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedState {
    Waiting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct ScheduledTask {
    id: String,
    title: String,
    priority: Priority,
    /// Dependencies not yet completed.
    pending: HashSet<String>,
    state: SchedState,
    /// Insertion sequence, the tie-breaker.
    seq: u64,
}

/// A task handed out by `next_ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTask {
    pub id: String,
    pub title: String,
    pub priority: Priority,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, ScheduledTask>,
    completed: HashSet<String>,
    next_seq: u64,
}

/// Thread-safe scheduler. Every operation is one brief critical section;
/// `next_ready` transitions returned tasks to running atomically with the
/// read.
#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Re-adding is allowed only after the previous record
    /// reached a terminal state (retry-after-failure, re-run-after-success).
    pub fn add_task(
        &self,
        id: &str,
        title: &str,
        depends_on: &[String],
        priority: Priority,
    ) -> Result<(), SchedulerError> {
        if depends_on.iter().any(|d| d == id) {
            return Err(SchedulerError::SelfDependency { id: id.to_string() });
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = inner.tasks.get(id)
            && !matches!(existing.state, SchedState::Completed | SchedState::Failed)
        {
            return Err(SchedulerError::DuplicateTask { id: id.to_string() });
        }

        // A re-added id is no longer a satisfied dependency.
        inner.completed.remove(id);

        let pending: HashSet<String> = depends_on
            .iter()
            .filter(|d| !inner.completed.contains(*d))
            .cloned()
            .collect();

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.tasks.insert(
            id.to_string(),
            ScheduledTask {
                id: id.to_string(),
                title: title.to_string(),
                priority,
                pending,
                state: SchedState::Waiting,
                seq,
            },
        );
        Ok(())
    }

    /// Return up to `max` ready tasks (all of them when `max == 0`),
    /// transitioning each to running.
    pub fn next_ready(&self, max: usize) -> Vec<ReadyTask> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut ready: Vec<(u8, u64, String)> = inner
            .tasks
            .values()
            .filter(|t| t.state == SchedState::Waiting && t.pending.is_empty())
            .map(|t| (t.priority.rank(), t.seq, t.id.clone()))
            .collect();
        ready.sort();

        let take = if max == 0 { ready.len() } else { max.min(ready.len()) };
        ready
            .into_iter()
            .take(take)
            .filter_map(|(_, _, id)| {
                let task = inner.tasks.get_mut(&id)?;
                task.state = SchedState::Running;
                Some(ReadyTask {
                    id: task.id.clone(),
                    title: task.title.clone(),
                    priority: task.priority,
                })
            })
            .collect()
    }

    /// Transition running → completed and unblock dependents.
    pub fn mark_completed(&self, id: &str) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.tasks.get_mut(id) {
            Some(task) if task.state == SchedState::Running => {
                task.state = SchedState::Completed;
            }
            _ => return Err(SchedulerError::NotRunning { id: id.to_string() }),
        }
        inner.completed.insert(id.to_string());
        for task in inner.tasks.values_mut() {
            task.pending.remove(id);
        }
        Ok(())
    }

    /// Transition running → failed. Dependents stay waiting.
    pub fn mark_failed(&self, id: &str) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.tasks.get_mut(id) {
            Some(task) if task.state == SchedState::Running => {
                task.state = SchedState::Failed;
                Ok(())
            }
            _ => Err(SchedulerError::NotRunning { id: id.to_string() }),
        }
    }

    /// Number of registered tasks not yet handed out or finished.
    pub fn queue_length(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .values()
            .filter(|t| t.state == SchedState::Waiting)
            .count()
    }

    pub fn completed_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .values()
            .filter(|t| t.state == SchedState::Completed)
            .count()
    }

    pub fn running_tasks(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut running: Vec<(u64, String)> = inner
            .tasks
            .values()
            .filter(|t| t.state == SchedState::Running)
            .map(|t| (t.seq, t.id.clone()))
            .collect();
        running.sort();
        running.into_iter().map(|(_, id)| id).collect()
    }

    pub fn state_of(&self, id: &str) -> Option<SchedState> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.get(id).map(|t| t.state)
    }

    /// Whether no more progress is possible: nothing running, and every
    /// waiting task is stranded behind a failed or unregistered dependency.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.values().all(|t| match t.state {
            SchedState::Completed | SchedState::Failed => true,
            SchedState::Running => false,
            SchedState::Waiting => {
                !t.pending.is_empty()
                    && t.pending.iter().any(|dep| {
                        matches!(
                            inner.tasks.get(dep).map(|d| d.state),
                            Some(SchedState::Failed) | None
                        )
                    })
            }
        })
    }
}

/// Validate that a dependency map is acyclic and self-reference free.
/// Used before bulk enqueue; the incremental scheduler itself only rejects
/// self-dependencies.
pub fn validate_acyclic(deps: &HashMap<String, Vec<String>>) -> Result<(), SchedulerError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: &str,
        deps: &HashMap<String, Vec<String>>,
        marks: &mut HashMap<String, Mark>,
    ) -> Result<(), SchedulerError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(SchedulerError::DependencyCycle { id: id.to_string() });
            }
            None => {}
        }
        marks.insert(id.to_string(), Mark::Visiting);
        if let Some(children) = deps.get(id) {
            for child in children {
                visit(child, deps, marks)?;
            }
        }
        marks.insert(id.to_string(), Mark::Done);
        Ok(())
    }

    for (id, children) in deps {
        if children.iter().any(|c| c == id) {
            return Err(SchedulerError::SelfDependency { id: id.clone() });
        }
    }
    let mut marks = HashMap::new();
    for id in deps.keys() {
        visit(id, deps, &mut marks)?;
    }
    Ok(())
}
