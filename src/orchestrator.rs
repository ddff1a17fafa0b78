//! The orchestrator: tick loop, worker spawning, reaping, shutdown.
//!
//! A periodic tick (every `poll_interval`) drains worker results, reports
//! them to the scheduler, and spawns workers for ready tasks up to the
//! concurrency cap. One cancellation root fans out to workers; `stop`
//! cancels it and `wait` blocks until the scheduler has no pending work and
//! the pool is empty.

use crate::config::CoreConfig;
use crate::errors::{SchedulerError, TriggerError};
use crate::pool::WorkerPool;
use crate::scheduler::{Scheduler, validate_acyclic};
use crate::storage::Storage;
use crate::task::Task;
use crate::triggers::TriggerDef;
use crate::worker::{TaskPlan, Worker, WorkerDeps, WorkerOutcome, WorkerStatus};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds per-task plans. The default derives the plan from task weight;
/// callers override it to attach triggers, checks, and retry maps.
pub type PlanFactory = dyn Fn(&Task) -> TaskPlan + Send + Sync;

/// Drives tasks from the scheduler through the worker pool.
pub struct Orchestrator {
    config: CoreConfig,
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    deps: Arc<WorkerDeps>,
    plans: Arc<PlanFactory>,
    cancel: CancellationToken,
    capacity: Arc<Semaphore>,
    status_tx: mpsc::UnboundedSender<(String, WorkerStatus)>,
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, WorkerStatus)>>>,
    result_tx: mpsc::UnboundedSender<(String, WorkerOutcome)>,
    result_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, WorkerOutcome)>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: CoreConfig, deps: Arc<WorkerDeps>) -> Self {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let capacity = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            scheduler: Arc::new(Scheduler::new()),
            pool: Arc::new(WorkerPool::new()),
            deps,
            plans: Arc::new(|task: &Task| TaskPlan::for_weight(task.weight)),
            cancel: CancellationToken::new(),
            capacity,
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
            loop_handle: Mutex::new(None),
        }
    }

    /// Replace the default weight-derived plan factory.
    pub fn with_plan_factory(
        mut self,
        factory: impl Fn(&Task) -> TaskPlan + Send + Sync + 'static,
    ) -> Self {
        self.plans = Arc::new(factory);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Persist a task and register it with the scheduler.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        self.deps
            .storage
            .save_task(&task)
            .await
            .context("Failed to persist task")?;
        self.scheduler
            .add_task(&task.id, &task.title, &task.depends_on, task.priority)
            .map_err(|e| anyhow::anyhow!(e))?;
        debug!(task_id = %task.id, "task enqueued");
        Ok(())
    }

    /// Bulk-enqueue an initiative's tasks in order, after validating the
    /// dependency graph, then fire the initiative-planned trigger.
    pub async fn enqueue_initiative(&self, initiative_id: &str) -> Result<()> {
        let initiative = self
            .deps
            .storage
            .load_initiative(initiative_id)
            .await?
            .with_context(|| format!("initiative {} not found", initiative_id))?;

        let mut tasks = Vec::new();
        let mut deps_map: HashMap<String, Vec<String>> = HashMap::new();
        for task_id in &initiative.tasks {
            let task = self
                .deps
                .storage
                .load_task(task_id)
                .await?
                .with_context(|| format!("task {} not found", task_id))?;
            deps_map.insert(task.id.clone(), task.depends_on.clone());
            tasks.push(task);
        }
        validate_acyclic(&deps_map).map_err(|e| anyhow::anyhow!(e))?;

        for task in &tasks {
            self.scheduler
                .add_task(&task.id, &task.title, &task.depends_on, task.priority)
                .map_err(|e| anyhow::anyhow!(e))?;
        }

        match self
            .deps
            .triggers
            .run_initiative_planned(
                &self.cancel,
                &self.deps.lifecycle_triggers,
                initiative_id,
                &initiative.tasks,
            )
            .await
        {
            Ok(()) => {}
            Err(TriggerError::Gate(rejection)) => {
                anyhow::bail!("initiative-planned gate rejected: {}", rejection);
            }
            Err(e) => warn!(initiative_id, error = %e, "initiative-planned trigger failed"),
        }

        info!(initiative_id, tasks = tasks.len(), "initiative enqueued");
        Ok(())
    }

    /// Move a terminal task back to PLANNED and re-register it.
    pub async fn rewind(&self, task_id: &str) -> Result<()> {
        let mut task = self
            .deps
            .storage
            .load_task(task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;
        task.rewind();
        self.deps.storage.save_task(&task).await?;

        match self
            .scheduler
            .add_task(&task.id, &task.title, &task.depends_on, task.priority)
        {
            Ok(()) | Err(SchedulerError::DuplicateTask { .. }) => Ok(()),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }

    /// Start the main loop. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    async fn run_loop(self: Arc<Self>) {
        let receivers = {
            let mut status_slot = self.status_rx.lock().unwrap_or_else(|e| e.into_inner());
            let mut result_slot = self.result_rx.lock().unwrap_or_else(|e| e.into_inner());
            status_slot.take().zip(result_slot.take())
        };
        let Some((mut status_rx, mut result_rx)) = receivers else {
            warn!("orchestrator loop already consumed its channels");
            return;
        };

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            // Worker status transitions (starting -> running).
            while let Ok((task_id, status)) = status_rx.try_recv() {
                self.pool.set_status(&task_id, status, None);
            }

            // Reap finished workers and report to the scheduler.
            while let Ok((task_id, outcome)) = result_rx.try_recv() {
                self.reap(&task_id, outcome);
            }

            // Spawn workers for ready tasks up to capacity.
            let free = self.capacity.available_permits();
            if free > 0 {
                for ready in self.scheduler.next_ready(free) {
                    self.spawn_worker(&ready.id).await;
                }
            }
        }

        debug!("orchestrator loop stopped");
    }

    fn reap(&self, task_id: &str, outcome: WorkerOutcome) {
        match &outcome {
            WorkerOutcome::Completed => {
                self.pool.set_status(task_id, WorkerStatus::Complete, None);
                if let Err(e) = self.scheduler.mark_completed(task_id) {
                    warn!(task_id, error = %e, "scheduler completion report failed");
                }
            }
            WorkerOutcome::Paused { resume_phase } => {
                // A parked task occupies no capacity and stays out of the
                // ready queue until externally resumed.
                self.pool.set_status(task_id, WorkerStatus::Complete, None);
                if let Err(e) = self.scheduler.mark_failed(task_id) {
                    warn!(task_id, error = %e, "scheduler pause report failed");
                }
                info!(task_id, resume_phase = ?resume_phase, "task paused at human gate");
            }
            WorkerOutcome::Failed(error) => {
                self.pool
                    .set_status(task_id, WorkerStatus::Failed, Some(error.to_string()));
                if let Err(e) = self.scheduler.mark_failed(task_id) {
                    warn!(task_id, error = %e, "scheduler failure report failed");
                }
            }
        }
        self.pool.reap(task_id);
    }

    async fn spawn_worker(&self, task_id: &str) {
        let Ok(permit) = self.capacity.clone().acquire_owned().await else {
            return;
        };

        let task = match self.deps.storage.load_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "ready task missing from storage");
                let _ = self.scheduler.mark_failed(task_id);
                return;
            }
            Err(e) => {
                warn!(task_id, error = %e, "ready task load failed");
                let _ = self.scheduler.mark_failed(task_id);
                return;
            }
        };

        let cancel = self.cancel.child_token();
        let plan = (self.plans)(&task);
        let worker = Worker::new(task_id, plan, self.deps.clone(), cancel.clone())
            .with_status_channel(self.status_tx.clone());

        let result_tx = self.result_tx.clone();
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            let _permit = permit; // Capacity held until the worker exits.
            let outcome = worker.run().await;
            let _ = result_tx.send((id, outcome));
        });

        if !self.pool.register(task_id, cancel, handle) {
            // Already have an active worker for this id; should not happen
            // because the scheduler hands a task out once.
            warn!(task_id, "duplicate worker suppressed");
        }
    }

    /// Resume a task parked at a human gate: move it back through the
    /// scheduler so the next tick spawns a worker that skips completed
    /// phases.
    pub async fn resume(&self, task_id: &str) -> Result<()> {
        let task = self
            .deps
            .storage
            .load_task(task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;
        if self.pool.has_worker(task_id) {
            anyhow::bail!("task {} already has a live worker", task_id);
        }
        match self
            .scheduler
            .add_task(&task.id, &task.title, &task.depends_on, task.priority)
        {
            Ok(()) | Err(SchedulerError::DuplicateTask { .. }) => Ok(()),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }

    /// Cancel everything: the tick loop and all in-flight workers.
    pub fn stop(&self) {
        info!("orchestrator stopping");
        self.cancel.cancel();
        self.pool.cancel_all();
    }

    /// Block until the scheduler reports no pending or running work and the
    /// pool is empty.
    pub async fn wait(&self) {
        let idle_poll = Duration::from_millis(50).min(self.config.poll_interval);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.scheduler.is_complete() && self.pool.active_count() == 0 {
                break;
            }
            tokio::time::sleep(idle_poll).await;
        }
    }

    /// Stop and join the loop and all workers. Closes the event bus.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = {
            let mut slot = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        futures::future::join_all(self.pool.take_handles()).await;
        self.deps.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;

    #[test]
    fn test_default_plan_factory_uses_weight() {
        let factory: Arc<PlanFactory> = Arc::new(|task: &Task| TaskPlan::for_weight(task.weight));
        let task = Task::new("task-1", "T", Weight::Trivial);
        let plan = factory(&task);
        assert_eq!(plan.phase_order(), vec!["implement"]);
    }
}
