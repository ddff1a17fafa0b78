//! Task, initiative, and execution-record types.
//!
//! Tasks are owned by the storage collaborator; the core reads and mutates
//! them through the `Storage` trait. The execution record carries the
//! per-task resumption state (current phase, iteration counter, retry
//! attempts, completed-phase set).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Effort class of a task. Determines the phase plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
    Greenfield,
}

/// Scheduling priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank: lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Which queue a task sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Active,
    Backlog,
}

/// Task lifecycle status as observed by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created or rewound; eligible for scheduling.
    #[default]
    Planned,
    /// A worker is executing the plan.
    Running,
    /// Parked at a human gate awaiting external resumption.
    Paused,
    /// Blocked by external request.
    Blocked,
    /// Plan finished; terminal bookkeeping in progress.
    Finalizing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Mutable per-task execution state, serialized with the task.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExecutionRecord {
    /// Phase currently (or last) being executed.
    #[serde(default)]
    pub current_phase: Option<String>,
    /// Iteration counter within the current phase.
    #[serde(default)]
    pub iteration: u32,
    /// Cross-phase retry attempts consumed.
    #[serde(default)]
    pub retry_attempts: u32,
    /// Human-readable reason for the last failure.
    #[serde(default)]
    pub last_failure: Option<String>,
    /// Identifiers of phases that checkpointed as complete.
    #[serde(default)]
    pub completed_phases: HashSet<String>,
}

impl ExecutionRecord {
    pub fn is_phase_complete(&self, phase: &str) -> bool {
        self.completed_phases.contains(phase)
    }

    /// Checkpoint a phase and reset the iteration counter.
    pub fn mark_phase_complete(&mut self, phase: &str) {
        self.completed_phases.insert(phase.to_string());
        self.iteration = 0;
    }

    /// Rewind to `restart_phase` for a cross-phase retry: the restart phase
    /// and everything after it (in `plan_order`) is no longer complete.
    pub fn reset_to_phase(&mut self, restart_phase: &str, plan_order: &[String]) {
        if let Some(pos) = plan_order.iter().position(|p| p == restart_phase) {
            for phase in &plan_order[pos..] {
                self.completed_phases.remove(phase);
            }
        }
        self.current_phase = Some(restart_phase.to_string());
        self.iteration = 0;
    }

    /// Full reset, used by rewind-to-planned.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A unit of work driven through a phase plan by one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Weight,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub queue: QueueKind,
    /// Initiative this task belongs to, if any.
    #[serde(default)]
    pub initiative: Option<String>,
    /// Identifiers of tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub execution: ExecutionRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: &str, title: &str, weight: Weight) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            weight,
            status: TaskStatus::Planned,
            priority: Priority::default(),
            queue: QueueKind::default(),
            initiative: None,
            depends_on: Vec::new(),
            execution: ExecutionRecord::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_initiative(mut self, initiative: &str) -> Self {
        self.initiative = Some(initiative.to_string());
        self
    }

    /// Move a terminal or parked task back to PLANNED, clearing execution
    /// state so the scheduler can pick it up again from the first phase.
    pub fn rewind(&mut self) {
        self.status = TaskStatus::Planned;
        self.execution.reset();
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A named grouping of tasks used for bulk enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub name: String,
    /// Task identifiers in enqueue order.
    pub tasks: Vec<String>,
}

impl Initiative {
    pub fn new(id: &str, name: &str, tasks: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            tasks,
        }
    }
}
