//! Per-task worker: the phase executor.
//!
//! A worker owns one task for its lifetime. It acquires the PID guard, then
//! the lock, then runs each phase of the plan in order: before-phase
//! triggers, then the agent iteration loop until the completion marker
//! appears, then quality checks and optional external validation, then a
//! checkpoint commit. Block-mode check failures and validator rejections
//! re-enter the loop with `{{RETRY_CONTEXT}}`; a failing later phase may
//! restart an earlier one through the retry map. Human-gated phases park the
//! task in PAUSED for external resumption.

use crate::agent::{AgentInvoker, AgentRequest};
use crate::config::{CoordinationMode, CoreConfig};
use crate::errors::{AgentError, TriggerError, WorkerError};
use crate::events::{Event, EventBus, EventKind};
use crate::lock::{HeartbeatRunner, LockManager};
use crate::pidguard::PidGuard;
use crate::plan::{GateKind, PhaseDisplay, plan_for};
use crate::prompt::{PromptService, RETRY_CONTEXT_VAR, VarMap};
use crate::quality::{CheckOutcome, CheckRunner, FailureMode, QualityCheck, tail_of};
use crate::repo::RepoOps;
use crate::signals::{StuckTracker, completion_declared, error_signature, extract_signals};
use crate::storage::Storage;
use crate::task::{Task, TaskStatus, Weight};
use crate::triggers::{TriggerDef, TriggerEvent, TriggerRunner};
use crate::validate::Validator;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of a worker as tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Complete,
    Failed,
}

/// Per-phase execution settings layered over the display plan.
#[derive(Clone)]
pub struct PhaseRun {
    pub id: String,
    pub name: String,
    pub gate: GateKind,
    /// Iteration budget override for this phase.
    pub max_iterations: Option<u32>,
    pub triggers: Vec<TriggerDef>,
    pub checks: Vec<QualityCheck>,
    /// Whether the validator cross-checks completion claims.
    pub validate: bool,
}

impl PhaseRun {
    pub fn from_display(display: &PhaseDisplay) -> Self {
        Self {
            id: display.id.clone(),
            name: display.name.clone(),
            gate: display.gate,
            max_iterations: None,
            triggers: Vec::new(),
            checks: Vec::new(),
            validate: false,
        }
    }
}

/// The executable plan for one task.
#[derive(Clone, Default)]
pub struct TaskPlan {
    pub phases: Vec<PhaseRun>,
    /// failing phase -> restart phase.
    pub retry_map: HashMap<String, String>,
    /// Override of the configured cross-phase retry budget.
    pub max_retries: Option<u32>,
}

impl TaskPlan {
    /// Build the plan for a task weight.
    pub fn for_weight(weight: Weight) -> Self {
        Self {
            phases: plan_for(weight).iter().map(PhaseRun::from_display).collect(),
            retry_map: HashMap::new(),
            max_retries: None,
        }
    }

    pub fn with_retry(mut self, failing: &str, restart: &str) -> Self {
        self.retry_map.insert(failing.to_string(), restart.to_string());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Customize one phase in place.
    pub fn map_phase(mut self, id: &str, f: impl FnOnce(&mut PhaseRun)) -> Self {
        if let Some(phase) = self.phases.iter_mut().find(|p| p.id == id) {
            f(phase);
        }
        self
    }

    pub fn phase_order(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.id.clone()).collect()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }
}

/// How a worker run ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed,
    /// Parked at a human gate; the next phase to run on resumption, if any.
    Paused { resume_phase: Option<String> },
    Failed(WorkerError),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Everything a worker needs, injected once and shared across workers.
pub struct WorkerDeps {
    pub storage: Arc<dyn Storage>,
    pub repo: Arc<dyn RepoOps>,
    pub prompts: Arc<dyn PromptService>,
    pub agent: Arc<dyn AgentInvoker>,
    pub triggers: TriggerRunner,
    pub checks: Arc<dyn CheckRunner>,
    pub validator: Option<Arc<dyn Validator>>,
    /// Lifecycle triggers applied to every task.
    pub lifecycle_triggers: Vec<TriggerDef>,
    pub locks: Arc<LockManager>,
    pub events: Arc<EventBus>,
    pub config: CoreConfig,
}

enum PhasesDone {
    Completed,
    Paused { resume_phase: Option<String> },
}

struct PhaseFailure {
    error: WorkerError,
    tail: String,
}

impl PhaseFailure {
    fn new(error: WorkerError) -> Self {
        Self {
            error,
            tail: String::new(),
        }
    }

    fn with_tail(error: WorkerError, tail: String) -> Self {
        Self { error, tail }
    }
}

/// Executes one task's plan.
pub struct Worker {
    task_id: String,
    plan: TaskPlan,
    deps: Arc<WorkerDeps>,
    cancel: CancellationToken,
    /// Narrow status channel back to the pool; no back-reference needed.
    status_tx: Option<mpsc::UnboundedSender<(String, WorkerStatus)>>,
}

impl Worker {
    pub fn new(task_id: &str, plan: TaskPlan, deps: Arc<WorkerDeps>, cancel: CancellationToken) -> Self {
        Self {
            task_id: task_id.to_string(),
            plan,
            deps,
            cancel,
            status_tx: None,
        }
    }

    pub fn with_status_channel(
        mut self,
        tx: mpsc::UnboundedSender<(String, WorkerStatus)>,
    ) -> Self {
        self.status_tx = Some(tx);
        self
    }

    fn signal_status(&self, status: WorkerStatus) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.send((self.task_id.clone(), status));
        }
    }

    fn publish(&self, event: Event) {
        self.deps.events.publish(event);
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind, &self.task_id)
    }

    async fn save(&self, task: &Task) -> Result<(), WorkerError> {
        self.deps
            .storage
            .save_task(task)
            .await
            .map_err(WorkerError::Storage)
    }

    /// Run the task to a terminal outcome. With a nonzero `worker_timeout`,
    /// the deadline cancels the in-flight work and reports `TimedOut`.
    pub async fn run(&self) -> WorkerOutcome {
        let timeout = self.deps.config.worker_timeout;
        if timeout.is_zero() {
            return self.run_guarded().await;
        }

        let inner = self.run_guarded();
        tokio::pin!(inner);
        tokio::select! {
            outcome = &mut inner => outcome,
            _ = tokio::time::sleep(timeout) => {
                self.cancel.cancel();
                // Let the phase loop unwind so the subprocess is reaped and
                // locks are released.
                match inner.await {
                    WorkerOutcome::Failed(e) if e.is_cancellation() => {
                        WorkerOutcome::Failed(WorkerError::TimedOut)
                    }
                    other => other,
                }
            }
        }
    }

    async fn run_guarded(&self) -> WorkerOutcome {
        let mut task = match self.deps.storage.load_task(&self.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                let error = WorkerError::Storage(anyhow::anyhow!("task {} not found", self.task_id));
                self.publish(
                    self.event(EventKind::Error)
                        .with("message", json!(error.to_string())),
                );
                return WorkerOutcome::Failed(error);
            }
            Err(e) => {
                self.publish(
                    self.event(EventKind::Error).with("message", json!(e.to_string())),
                );
                return WorkerOutcome::Failed(WorkerError::Storage(e));
            }
        };

        // Worktree first: the PID guard lives inside it.
        let worktree = match self.deps.repo.create_worktree(&self.task_id).await {
            Ok(path) => path,
            Err(e) => return self.fail_task(&mut task, WorkerError::Repo(e)).await,
        };

        // PID guard before lock, always.
        let guard = PidGuard::for_worktree(&worktree);
        if let Err(e) = guard.acquire() {
            // Another process of this user owns the task; abort the start
            // without touching the task record.
            self.publish(
                self.event(EventKind::Error).with("message", json!(e.to_string())),
            );
            return WorkerOutcome::Failed(e.into());
        }

        if let Err(e) = self.deps.locks.acquire(&self.task_id) {
            let _ = guard.release();
            self.publish(
                self.event(EventKind::Error).with("message", json!(e.to_string())),
            );
            return WorkerOutcome::Failed(e.into());
        }

        let hb_cancel = self.cancel.child_token();
        let heartbeat = (self.deps.config.mode == CoordinationMode::Peer).then(|| {
            HeartbeatRunner::new(self.deps.locks.clone(), self.deps.config.heartbeat_interval)
                .spawn(&self.task_id, hb_cancel.clone())
        });

        task.status = TaskStatus::Running;
        task.touch();
        let outcome = match self.save(&task).await {
            Err(e) => Err(PhaseFailure::new(e)),
            Ok(()) => {
                self.signal_status(WorkerStatus::Running);
                self.publish(
                    self.event(EventKind::TaskStarted).with("title", json!(task.title)),
                );
                info!(task_id = %self.task_id, "worker started");
                self.run_phases(&mut task, &worktree)
                    .await
                    .map_err(PhaseFailure::new)
            }
        };

        // Release in reverse: heartbeat, lock, PID guard.
        hb_cancel.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }
        if let Err(e) = self.deps.locks.release(&self.task_id) {
            warn!(task_id = %self.task_id, error = %e, "lock release failed");
        }
        if let Err(e) = guard.release() {
            warn!(task_id = %self.task_id, error = %e, "pid guard release failed");
        }

        match outcome {
            Ok(PhasesDone::Completed) => self.finish_task(&mut task).await,
            Ok(PhasesDone::Paused { resume_phase }) => {
                task.status = TaskStatus::Paused;
                task.touch();
                if let Err(e) = self.save(&task).await {
                    return WorkerOutcome::Failed(e);
                }
                info!(task_id = %self.task_id, "worker parked at human gate");
                WorkerOutcome::Paused { resume_phase }
            }
            Err(failure) => self.fail_task(&mut task, failure.error).await,
        }
    }

    async fn finish_task(&self, task: &mut Task) -> WorkerOutcome {
        task.status = TaskStatus::Finalizing;
        task.touch();
        if let Err(e) = self.save(task).await {
            return WorkerOutcome::Failed(e);
        }

        task.status = TaskStatus::Completed;
        task.touch();
        if let Err(e) = self.save(task).await {
            return WorkerOutcome::Failed(e);
        }

        self.publish(self.event(EventKind::Complete));
        if let Err(e) = self
            .deps
            .triggers
            .run_lifecycle(
                &self.cancel,
                TriggerEvent::TaskCompleted,
                &self.deps.lifecycle_triggers,
                task,
            )
            .await
        {
            warn!(task_id = %self.task_id, error = %e, "task-completed trigger failed");
        }

        // Completed tasks release their worktree; failures keep theirs.
        if let Err(e) = self.deps.repo.remove_worktree(&self.task_id, false).await {
            warn!(task_id = %self.task_id, error = %e, "worktree removal failed");
        }

        info!(task_id = %self.task_id, "worker completed");
        WorkerOutcome::Completed
    }

    /// Mark the task failed (or rewound, for cancellation), publish the
    /// terminal event, and preserve the worktree for debugging.
    async fn fail_task(&self, task: &mut Task, error: WorkerError) -> WorkerOutcome {
        if error.is_cancellation() {
            // Orderly shutdown: leave the task resumable.
            task.status = TaskStatus::Planned;
        } else {
            task.status = TaskStatus::Failed;
        }
        task.execution.last_failure = Some(error.to_string());
        task.touch();
        if let Err(e) = self.save(task).await {
            warn!(task_id = %self.task_id, error = %e, "failed to persist task failure");
        }

        self.publish(
            self.event(EventKind::Error)
                .with("message", json!(error.to_string())),
        );

        if !error.is_cancellation()
            && let Err(e) = self
                .deps
                .triggers
                .run_lifecycle(
                    &self.cancel,
                    TriggerEvent::TaskFailed,
                    &self.deps.lifecycle_triggers,
                    task,
                )
                .await
        {
            warn!(task_id = %self.task_id, error = %e, "task-failed trigger failed");
        }

        if let Err(e) = self.deps.repo.remove_worktree(&self.task_id, true).await {
            warn!(task_id = %self.task_id, error = %e, "worktree preservation failed");
        }

        warn!(task_id = %self.task_id, error = %error, "worker failed");
        WorkerOutcome::Failed(error)
    }

    async fn run_phases(&self, task: &mut Task, worktree: &Path) -> Result<PhasesDone, WorkerError> {
        let order = self.plan.phase_order();
        let max_retries = self.plan.max_retries.unwrap_or(self.deps.config.max_retries);
        let mut vars = VarMap::new();
        let mut idx = 0;

        while idx < self.plan.phases.len() {
            if self.cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            let phase = &self.plan.phases[idx];

            // Resumption: already-checkpointed phases are skipped.
            if task.execution.is_phase_complete(&phase.id) {
                idx += 1;
                continue;
            }

            task.execution.current_phase = Some(phase.id.clone());
            self.save(task).await?;
            self.publish(
                self.event(EventKind::PhaseStarted).with("phase", json!(phase.id)),
            );

            match self
                .deps
                .triggers
                .run_before_phase(&self.cancel, &phase.id, &phase.triggers, &vars, task)
                .await
            {
                Ok(updated) => vars = updated,
                Err(TriggerError::Gate(rejection)) => {
                    return Err(WorkerError::GateRejected(rejection));
                }
                Err(TriggerError::Cancelled) => return Err(WorkerError::Cancelled),
                Err(TriggerError::Infra(e)) => {
                    warn!(phase = %phase.id, error = %e, "before-phase trigger infra failure");
                }
            }

            match self.run_phase_loop(task, phase, worktree, &mut vars).await {
                Ok(()) => {
                    task.execution.mark_phase_complete(&phase.id);
                    self.save(task).await?;
                    self.deps
                        .repo
                        .commit(worktree, &format!("{}: phase {} complete", task.id, phase.id))
                        .await
                        .map_err(WorkerError::Repo)?;
                    self.publish(
                        self.event(EventKind::PhaseComplete).with("phase", json!(phase.id)),
                    );

                    match self
                        .deps
                        .triggers
                        .run_lifecycle(
                            &self.cancel,
                            TriggerEvent::PhaseComplete,
                            &self.deps.lifecycle_triggers,
                            task,
                        )
                        .await
                    {
                        Ok(()) => {}
                        Err(TriggerError::Gate(rejection)) => {
                            return Err(WorkerError::GateRejected(rejection));
                        }
                        Err(TriggerError::Cancelled) => return Err(WorkerError::Cancelled),
                        Err(TriggerError::Infra(e)) => {
                            // A completed phase is not un-completed by hook
                            // infrastructure trouble.
                            warn!(phase = %phase.id, error = %e, "phase-complete trigger infra failure");
                        }
                    }

                    if phase.gate == GateKind::Human {
                        return Ok(PhasesDone::Paused {
                            resume_phase: self.plan.phases.get(idx + 1).map(|p| p.id.clone()),
                        });
                    }
                    idx += 1;
                }
                Err(failure) => {
                    if failure.error.is_cancellation() {
                        return Err(failure.error);
                    }

                    let Some(restart) = self.plan.retry_map.get(&phase.id) else {
                        return Err(failure.error);
                    };
                    let Some(restart_idx) = self.plan.index_of(restart) else {
                        warn!(phase = %phase.id, restart = %restart, "retry map names unknown phase");
                        return Err(failure.error);
                    };
                    if task.execution.retry_attempts >= max_retries {
                        return Err(WorkerError::RetryExhausted {
                            phase: phase.id.clone(),
                            attempts: task.execution.retry_attempts,
                        });
                    }

                    task.execution.retry_attempts += 1;
                    let attempt = task.execution.retry_attempts;
                    vars.insert(
                        RETRY_CONTEXT_VAR.to_string(),
                        format!(
                            "Retry attempt {attempt}: phase {} failed.\nReason: {}\nOutput tail:\n{}",
                            phase.id, failure.error, failure.tail
                        ),
                    );
                    task.execution.reset_to_phase(restart, &order);
                    self.save(task).await?;
                    info!(
                        task_id = %self.task_id,
                        failing = %phase.id,
                        restart = %restart,
                        attempt,
                        "cross-phase retry"
                    );
                    idx = restart_idx;
                }
            }
        }

        Ok(PhasesDone::Completed)
    }

    /// The agent iteration loop for one phase ("Ralph loop"): same prompt
    /// each round, state evolves in the worktree. Quality-check retries
    /// share the iteration budget with completion-marker iterations.
    async fn run_phase_loop(
        &self,
        task: &mut Task,
        phase: &PhaseRun,
        worktree: &Path,
        vars: &mut VarMap,
    ) -> Result<(), PhaseFailure> {
        let budget = phase
            .max_iterations
            .unwrap_or(self.deps.config.max_iterations)
            .max(1);
        let tail_bytes = self.deps.config.output_tail_bytes;
        let mut stuck = StuckTracker::new(3);
        let mut last_tail = String::new();

        for iteration in 1..=budget {
            if self.cancel.is_cancelled() {
                return Err(PhaseFailure::new(WorkerError::Cancelled));
            }
            task.execution.iteration = iteration;

            let prompt = self
                .deps
                .prompts
                .render_phase_prompt(task, &phase.id, vars)
                .map_err(|e| PhaseFailure::new(WorkerError::Prompt(e)))?;

            let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
            let events = self.deps.events.clone();
            let task_id = self.task_id.clone();
            let phase_id = phase.id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(line) = line_rx.recv().await {
                    events.publish(
                        Event::new(EventKind::IterationOutput, &task_id)
                            .with("phase", json!(phase_id))
                            .with("iteration", json!(iteration))
                            .with("line", json!(line)),
                    );
                }
            });

            let request = AgentRequest {
                task_id: self.task_id.clone(),
                phase: phase.id.clone(),
                prompt,
                workdir: worktree.to_path_buf(),
                cancel: self.cancel.child_token(),
            };
            let result = self.deps.agent.invoke(request, line_tx).await;
            let _ = forwarder.await;

            let output = match result {
                Ok(output) => output,
                Err(AgentError::Cancelled) => {
                    return Err(PhaseFailure::new(WorkerError::Cancelled));
                }
                Err(e) => {
                    // Spawn and I/O failures count toward the budget.
                    warn!(
                        phase = %phase.id,
                        iteration,
                        error = %e,
                        "agent invocation failed"
                    );
                    continue;
                }
            };

            let signals = extract_signals(&output.output);
            if let Some(progress) = signals.latest_progress() {
                self.publish(
                    self.event(EventKind::IterationOutput)
                        .with("phase", json!(phase.id))
                        .with("iteration", json!(iteration))
                        .with("progress", json!(progress)),
                );
            }

            if !completion_declared(&output.output) {
                let signature = error_signature(&output.output);
                if stuck.observe(signature.as_deref()) {
                    let signature = stuck.signature().unwrap_or_default().to_string();
                    self.publish(
                        self.event(EventKind::StuckDetected)
                            .with("phase", json!(phase.id))
                            .with("signature", json!(signature)),
                    );
                    return Err(PhaseFailure::with_tail(
                        WorkerError::Stuck {
                            phase: phase.id.clone(),
                            signature,
                            iterations: stuck.streak(),
                        },
                        tail_of(&output.output, tail_bytes),
                    ));
                }

                if let Some(blocker) = signals.blockers.last() {
                    task.execution.last_failure = Some(blocker.clone());
                }
                debug!(phase = %phase.id, iteration, "no completion marker, iterating");
                last_tail = tail_of(&output.output, tail_bytes);
                continue;
            }

            // Completion claimed: run quality checks.
            let mut blocking: Option<CheckOutcome> = None;
            for check in phase.checks.iter().filter(|c| c.failure_mode != FailureMode::Skip) {
                let outcome = match self.deps.checks.run(check, worktree).await {
                    Ok(outcome) => outcome,
                    Err(e) => CheckOutcome {
                        name: check.name.clone(),
                        exit_code: -1,
                        passed: false,
                        tail: e.to_string(),
                    },
                };
                self.publish(
                    self.event(EventKind::QualityCheckResult)
                        .with("check", json!(outcome.name))
                        .with("exit_code", json!(outcome.exit_code))
                        .with("passed", json!(outcome.passed)),
                );
                if !outcome.passed {
                    match check.failure_mode {
                        FailureMode::Block => {
                            blocking = Some(outcome);
                            break;
                        }
                        FailureMode::Warn => {
                            warn!(check = %outcome.name, "quality check failed (warn mode)");
                        }
                        // Skip-mode checks are filtered out above.
                        FailureMode::Skip => {}
                    }
                }
            }

            if let Some(outcome) = blocking {
                last_tail = tail_of(&outcome.tail, tail_bytes);
                if iteration == budget {
                    return Err(PhaseFailure::with_tail(
                        WorkerError::QualityCheckFailed {
                            check: outcome.name,
                            tail: last_tail.clone(),
                        },
                        last_tail,
                    ));
                }
                vars.insert(
                    RETRY_CONTEXT_VAR.to_string(),
                    format!(
                        "Quality check '{}' failed (exit {}):\n{}",
                        outcome.name, outcome.exit_code, last_tail
                    ),
                );
                continue;
            }

            // External validation of the completion claim.
            if phase.validate
                && let Some(validator) = &self.deps.validator
            {
                match validator.validate(task, &phase.id, &output.output).await {
                    Ok(verdict) if verdict.approved => {}
                    Ok(verdict) => {
                        last_tail = verdict.reason.clone();
                        if iteration == budget {
                            return Err(PhaseFailure::with_tail(
                                WorkerError::ValidatorRejected {
                                    phase: phase.id.clone(),
                                    reason: verdict.reason,
                                },
                                last_tail,
                            ));
                        }
                        vars.insert(
                            RETRY_CONTEXT_VAR.to_string(),
                            format!("Validator rejected the completion claim: {}", verdict.reason),
                        );
                        continue;
                    }
                    Err(e) => {
                        if self.deps.config.fail_on_api_error {
                            return Err(PhaseFailure::new(WorkerError::ValidatorInfra(e)));
                        }
                        warn!(
                            phase = %phase.id,
                            error = %e,
                            "validator infrastructure failure, accepting claim"
                        );
                    }
                }
            }

            vars.remove(RETRY_CONTEXT_VAR);
            return Ok(());
        }

        Err(PhaseFailure::with_tail(
            WorkerError::IterationBudgetExhausted {
                phase: phase.id.clone(),
                iterations: budget,
            },
            last_tail,
        ))
    }
}
