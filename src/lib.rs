//! Core of a multi-task orchestration engine that drives an external
//! coding-agent subprocess through structured phase plans.
//!
//! The moving parts:
//!
//! 1. **Scheduler** — dependency-aware, priority-ordered queue feeding a
//!    bounded worker pool.
//! 2. **Worker / phase executor** — per-task loop that invokes the agent
//!    until it emits the completion marker, runs quality checks and optional
//!    validation, checkpoints progress, and supports cross-phase retry.
//! 3. **Trigger runner** — gate and reaction hooks evaluated by secondary
//!    agents before phases and on lifecycle events.
//! 4. **Lock / PID guard / worktree** — coordination so concurrent tasks and
//!    concurrent users do not interfere.
//!
//! The CLI, web UI, persistence backends, diff computation, and prompt
//! authoring are external collaborators reached through the traits in
//! [`storage`], [`repo`], [`prompt`], [`agent`], [`triggers`], [`validate`],
//! and [`quality`].

pub mod agent;
pub mod config;
pub mod diffcache;
pub mod errors;
pub mod events;
pub mod lock;
pub mod orchestrator;
pub mod pidguard;
pub mod plan;
pub mod pool;
pub mod prompt;
pub mod quality;
pub mod repo;
pub mod scheduler;
pub mod signals;
pub mod storage;
pub mod task;
pub mod triggers;
pub mod validate;
pub mod worker;

pub use config::{CoordinationMode, CoreConfig};
pub use errors::{
    AgentError, GateRejection, GuardError, LockError, SchedulerError, TriggerError, WorkerError,
};
pub use events::{Event, EventBus, EventKind};
pub use orchestrator::Orchestrator;
pub use scheduler::Scheduler;
pub use task::{Priority, Task, TaskStatus, Weight};
pub use worker::{TaskPlan, Worker, WorkerDeps, WorkerOutcome};
