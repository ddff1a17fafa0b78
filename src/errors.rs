//! Typed error hierarchy for the orc core.
//!
//! One enum per subsystem so callers can match on kinds:
//! - `SchedulerError` — task registration and queue failures
//! - `GuardError` — PID-guard failures (same-user double-run)
//! - `LockError` — filesystem lock failures (multi-user coordination)
//! - `AgentError` — agent subprocess failures
//! - `TriggerError` — gate/reaction evaluation failures
//! - `WorkerError` — phase-executor failures

use thiserror::Error;

/// Errors from the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task {id} is already registered")]
    DuplicateTask { id: String },

    #[error("Task {id} depends on itself")]
    SelfDependency { id: String },

    #[error("Dependency cycle involving task {id}")]
    DependencyCycle { id: String },

    #[error("Task {id} is not in the running state")]
    NotRunning { id: String },
}

/// Errors from the PID guard.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Another process (pid {pid}) is already running this task")]
    AlreadyRunning { pid: u32 },

    #[error("PID guard I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the filesystem lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Task {task_id} is locked by {owner}")]
    Held { owner: String, task_id: String },

    #[error("Lock file for task {task_id} is corrupt: {reason}")]
    Corrupt { task_id: String, reason: String },

    #[error("Lock I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single agent subprocess invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to read agent output: {0}")]
    Io(#[source] std::io::Error),

    #[error("Agent invocation was cancelled")]
    Cancelled,
}

/// A gate-mode trigger rejected the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRejection {
    /// Identifier of the rejecting trigger agent.
    pub agent_id: String,
    /// Reason supplied by the agent.
    pub reason: String,
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gate {} rejected: {}", self.agent_id, self.reason)
    }
}

/// Errors from trigger evaluation.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("{0}")]
    Gate(GateRejection),

    #[error("Trigger evaluation was cancelled")]
    Cancelled,

    #[error("Trigger agent infrastructure failure: {0}")]
    Infra(#[source] anyhow::Error),
}

/// Errors from a worker's phase loop. These map the task-level failure kinds.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{0}")]
    GateRejected(GateRejection),

    #[error("Phase {phase} stuck: {iterations} identical failures ({signature})")]
    Stuck {
        phase: String,
        signature: String,
        iterations: u32,
    },

    #[error("Phase {phase} exhausted {iterations} iterations without completion")]
    IterationBudgetExhausted { phase: String, iterations: u32 },

    #[error("Quality check '{check}' still failing after the iteration budget")]
    QualityCheckFailed { check: String, tail: String },

    #[error("Validator rejected phase {phase}: {reason}")]
    ValidatorRejected { phase: String, reason: String },

    #[error("Validator infrastructure failure: {0}")]
    ValidatorInfra(#[source] anyhow::Error),

    #[error("Retry budget exhausted after {attempts} attempts (failing phase {phase})")]
    RetryExhausted { phase: String, attempts: u32 },

    #[error("Prompt rendering failure: {0}")]
    Prompt(#[source] anyhow::Error),

    #[error("Storage failure: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Repository failure: {0}")]
    Repo(#[source] anyhow::Error),

    #[error("Worker timed out")]
    TimedOut,

    #[error("Worker was cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Whether this failure came from a deliberate stop rather than a defect.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rejection_carries_agent_and_reason() {
        let rej = GateRejection {
            agent_id: "spec-reviewer".into(),
            reason: "spec too vague".into(),
        };
        let err = WorkerError::GateRejected(rej.clone());
        match &err {
            WorkerError::GateRejected(r) => {
                assert_eq!(r.agent_id, "spec-reviewer");
                assert_eq!(r.reason, "spec too vague");
            }
            _ => panic!("Expected GateRejected variant"),
        }
        assert!(err.to_string().contains("spec too vague"));
    }

    #[test]
    fn lock_held_is_matchable() {
        let err = LockError::Held {
            owner: "alice@laptop".into(),
            task_id: "task-7".into(),
        };
        assert!(matches!(err, LockError::Held { .. }));
        assert!(err.to_string().contains("alice@laptop"));
    }

    #[test]
    fn guard_already_running_carries_pid() {
        let err = GuardError::AlreadyRunning { pid: 4242 };
        match &err {
            GuardError::AlreadyRunning { pid } => assert_eq!(*pid, 4242),
            _ => panic!("Expected AlreadyRunning"),
        }
    }

    #[test]
    fn stuck_error_carries_signature() {
        let err = WorkerError::Stuck {
            phase: "implement".into(),
            signature: "permission denied /x".into(),
            iterations: 3,
        };
        assert!(err.to_string().contains("permission denied /x"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn cancellation_kinds_are_flagged() {
        assert!(WorkerError::Cancelled.is_cancellation());
        assert!(WorkerError::TimedOut.is_cancellation());
        assert!(
            !WorkerError::RetryExhausted {
                phase: "test".into(),
                attempts: 3
            }
            .is_cancellation()
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SchedulerError::DuplicateTask { id: "a".into() });
        assert_std_error(&GuardError::AlreadyRunning { pid: 1 });
        assert_std_error(&LockError::Corrupt {
            task_id: "a".into(),
            reason: "bad ttl".into(),
        });
        assert_std_error(&AgentError::Cancelled);
        assert_std_error(&TriggerError::Cancelled);
        assert_std_error(&WorkerError::Cancelled);
    }
}
