//! Trigger evaluation: before-phase gates and lifecycle reactions.
//!
//! Triggers are evaluated by external trigger agents through the injected
//! `TriggerExecutor`. Gate-mode triggers run synchronously and can reject;
//! reaction-mode triggers are fire-and-forget on their own task, so a
//! panicking reaction cannot take down the worker. Before-phase gate
//! infrastructure failures are fail-open (warn and continue); lifecycle
//! failures surface to the caller.

use crate::errors::{GateRejection, TriggerError};
use crate::events::{Event, EventBus, EventKind};
use crate::prompt::VarMap;
use crate::task::Task;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Gate blocks; reaction never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Gate,
    Reaction,
}

/// Lifecycle events a trigger can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    PhaseComplete,
    TaskCompleted,
    TaskFailed,
    InitiativePlanned,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::PhaseComplete => "phase_complete",
            TriggerEvent::TaskCompleted => "task_completed",
            TriggerEvent::TaskFailed => "task_failed",
            TriggerEvent::InitiativePlanned => "initiative_planned",
        }
    }
}

/// Where an approving gate's output lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub variable_name: String,
}

/// A configured trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Identifier of the trigger agent; empty disables the trigger.
    pub agent_id: String,
    #[serde(default)]
    pub mode: TriggerMode,
    /// Lifecycle event this trigger listens to (lifecycle triggers only).
    #[serde(default)]
    pub event: Option<TriggerEvent>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub output: Option<OutputConfig>,
}

fn default_enabled() -> bool {
    true
}

impl TriggerDef {
    pub fn gate(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            mode: TriggerMode::Gate,
            event: None,
            enabled: true,
            output: None,
        }
    }

    pub fn reaction(agent_id: &str) -> Self {
        Self {
            mode: TriggerMode::Reaction,
            ..Self::gate(agent_id)
        }
    }

    pub fn on_event(mut self, event: TriggerEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_output_variable(mut self, name: &str) -> Self {
        self.output = Some(OutputConfig {
            variable_name: name.to_string(),
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn is_runnable(&self) -> bool {
        self.enabled && !self.agent_id.is_empty()
    }
}

/// What the trigger agent receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInput {
    pub task_id: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub event: Option<TriggerEvent>,
    #[serde(default)]
    pub variables: VarMap,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// What the trigger agent returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResult {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub output: String,
    /// Set when the agent's raw response could not be parsed cleanly.
    #[serde(default)]
    pub parse_error: Option<String>,
}

/// Abstraction over trigger-agent execution. Production wires this to the
/// same subprocess machinery as the phase executor.
#[async_trait]
pub trait TriggerExecutor: Send + Sync {
    async fn evaluate(&self, agent_id: &str, input: TriggerInput) -> Result<TriggerResult>;
}

/// Runs configured triggers with gate/reaction semantics.
pub struct TriggerRunner {
    executor: Arc<dyn TriggerExecutor>,
    events: Option<Arc<EventBus>>,
}

impl TriggerRunner {
    pub fn new(executor: Arc<dyn TriggerExecutor>) -> Self {
        Self {
            executor,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, kind: EventKind, task_id: &str, agent_id: &str, extra: Option<(&str, Value)>) {
        if let Some(events) = &self.events {
            let mut event = Event::new(kind, task_id).with("agent_id", json!(agent_id));
            if let Some((key, value)) = extra {
                event = event.with(key, value);
            }
            events.publish(event);
        }
    }

    /// Evaluate one gate, respecting cancellation.
    async fn evaluate_gate(
        &self,
        cancel: &CancellationToken,
        trigger: &TriggerDef,
        input: TriggerInput,
    ) -> Result<TriggerResult, TriggerError> {
        let task_id = input.task_id.clone();
        self.publish(EventKind::TriggerStarted, &task_id, &trigger.agent_id, None);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TriggerError::Cancelled),
            result = self.executor.evaluate(&trigger.agent_id, input) => result,
        };

        match result {
            Ok(result) => {
                self.publish(
                    EventKind::TriggerCompleted,
                    &task_id,
                    &trigger.agent_id,
                    Some(("approved", json!(result.approved))),
                );
                Ok(result)
            }
            Err(e) => {
                self.publish(
                    EventKind::TriggerFailed,
                    &task_id,
                    &trigger.agent_id,
                    Some(("error", json!(e.to_string()))),
                );
                Err(TriggerError::Infra(e))
            }
        }
    }

    /// Launch a reaction on its own task. The spawned task's panic is
    /// contained by the runtime; output is discarded.
    fn launch_reaction(&self, trigger: &TriggerDef, input: TriggerInput) {
        let executor = self.executor.clone();
        let agent_id = trigger.agent_id.clone();
        tokio::spawn(async move {
            match executor.evaluate(&agent_id, input).await {
                Ok(_) => debug!(agent_id = %agent_id, "reaction trigger finished"),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "reaction trigger failed"),
            }
        });
    }

    /// Run before-phase triggers in order.
    ///
    /// Gate rejections short-circuit and surface; gate infra failures are
    /// fail-open. On approval, a configured output variable with non-empty
    /// output is merged into the returned variable map.
    pub async fn run_before_phase(
        &self,
        cancel: &CancellationToken,
        phase: &str,
        triggers: &[TriggerDef],
        vars: &VarMap,
        task: &Task,
    ) -> Result<VarMap, TriggerError> {
        let mut updated = vars.clone();

        for trigger in triggers.iter().filter(|t| t.is_runnable()) {
            let input = TriggerInput {
                task_id: task.id.clone(),
                phase: Some(phase.to_string()),
                event: None,
                variables: updated.clone(),
                extra: Map::new(),
            };

            match trigger.mode {
                TriggerMode::Reaction => self.launch_reaction(trigger, input),
                TriggerMode::Gate => match self.evaluate_gate(cancel, trigger, input).await {
                    Ok(result) if result.approved => {
                        if let Some(output) = &trigger.output
                            && !result.output.is_empty()
                        {
                            updated.insert(output.variable_name.clone(), result.output);
                        }
                    }
                    Ok(result) => {
                        return Err(TriggerError::Gate(GateRejection {
                            agent_id: trigger.agent_id.clone(),
                            reason: result.reason,
                        }));
                    }
                    Err(TriggerError::Cancelled) => return Err(TriggerError::Cancelled),
                    Err(e) => {
                        warn!(
                            agent_id = %trigger.agent_id,
                            phase,
                            error = %e,
                            "before-phase trigger infrastructure failure, continuing"
                        );
                    }
                },
            }
        }

        Ok(updated)
    }

    /// Run lifecycle triggers whose event matches. Unlike before-phase, both
    /// gate rejections and infrastructure failures surface to the caller.
    pub async fn run_lifecycle(
        &self,
        cancel: &CancellationToken,
        event: TriggerEvent,
        triggers: &[TriggerDef],
        task: &Task,
    ) -> Result<(), TriggerError> {
        for trigger in triggers
            .iter()
            .filter(|t| t.is_runnable() && t.event == Some(event))
        {
            let input = TriggerInput {
                task_id: task.id.clone(),
                phase: task.execution.current_phase.clone(),
                event: Some(event),
                variables: VarMap::new(),
                extra: Map::new(),
            };

            match trigger.mode {
                TriggerMode::Reaction => self.launch_reaction(trigger, input),
                TriggerMode::Gate => {
                    let result = self.evaluate_gate(cancel, trigger, input).await?;
                    if !result.approved {
                        return Err(TriggerError::Gate(GateRejection {
                            agent_id: trigger.agent_id.clone(),
                            reason: result.reason,
                        }));
                    }
                }
            }
        }
        Ok(())
    }

    /// Initiative-planned variant: carries the initiative id and its task
    /// ids to matching triggers.
    pub async fn run_initiative_planned(
        &self,
        cancel: &CancellationToken,
        triggers: &[TriggerDef],
        initiative_id: &str,
        task_ids: &[String],
    ) -> Result<(), TriggerError> {
        for trigger in triggers
            .iter()
            .filter(|t| t.is_runnable() && t.event == Some(TriggerEvent::InitiativePlanned))
        {
            let mut extra = Map::new();
            extra.insert("initiative_id".into(), json!(initiative_id));
            extra.insert("task_ids".into(), json!(task_ids));
            let input = TriggerInput {
                task_id: initiative_id.to_string(),
                phase: None,
                event: Some(TriggerEvent::InitiativePlanned),
                variables: VarMap::new(),
                extra,
            };

            match trigger.mode {
                TriggerMode::Reaction => self.launch_reaction(trigger, input),
                TriggerMode::Gate => {
                    let result = self.evaluate_gate(cancel, trigger, input).await?;
                    if !result.approved {
                        return Err(TriggerError::Gate(GateRejection {
                            agent_id: trigger.agent_id.clone(),
                            reason: result.reason,
                        }));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted executor: answers per agent id, records invocation order.
    struct ScriptedExecutor {
        responses: Mutex<std::collections::HashMap<String, Result<TriggerResult, String>>>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                responses: Mutex::new(std::collections::HashMap::new()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn approve(self, agent_id: &str, output: &str) -> Self {
            self.responses.lock().unwrap().insert(
                agent_id.to_string(),
                Ok(TriggerResult {
                    approved: true,
                    reason: String::new(),
                    output: output.to_string(),
                    parse_error: None,
                }),
            );
            self
        }

        fn reject(self, agent_id: &str, reason: &str) -> Self {
            self.responses.lock().unwrap().insert(
                agent_id.to_string(),
                Ok(TriggerResult {
                    approved: false,
                    reason: reason.to_string(),
                    output: String::new(),
                    parse_error: None,
                }),
            );
            self
        }

        fn fail(self, agent_id: &str, message: &str) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(agent_id.to_string(), Err(message.to_string()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TriggerExecutor for ScriptedExecutor {
        async fn evaluate(&self, agent_id: &str, _input: TriggerInput) -> Result<TriggerResult> {
            self.calls.lock().unwrap().push(agent_id.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.responses.lock().unwrap().get(agent_id) {
                Some(Ok(result)) => Ok(result.clone()),
                Some(Err(message)) => anyhow::bail!("{}", message),
                None => Ok(TriggerResult {
                    approved: true,
                    reason: String::new(),
                    output: String::new(),
                    parse_error: None,
                }),
            }
        }
    }

    fn task() -> Task {
        Task::new("task-1", "Test task", Weight::Medium)
    }

    #[tokio::test]
    async fn test_gate_approval_merges_output_variable() {
        let executor = Arc::new(ScriptedExecutor::new().approve("ctx-agent", "captured context"));
        let runner = TriggerRunner::new(executor);

        let triggers = vec![TriggerDef::gate("ctx-agent").with_output_variable("EXTRA_CONTEXT")];
        let vars = runner
            .run_before_phase(
                &CancellationToken::new(),
                "implement",
                &triggers,
                &VarMap::new(),
                &task(),
            )
            .await
            .unwrap();

        assert_eq!(vars.get("EXTRA_CONTEXT").map(String::as_str), Some("captured context"));
    }

    #[tokio::test]
    async fn test_gate_rejection_short_circuits() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .approve("first", "")
                .reject("second", "spec too vague"),
        );
        let runner = TriggerRunner::new(executor.clone());

        let triggers = vec![
            TriggerDef::gate("first"),
            TriggerDef::gate("second"),
            TriggerDef::gate("third"),
        ];
        let err = runner
            .run_before_phase(
                &CancellationToken::new(),
                "implement",
                &triggers,
                &VarMap::new(),
                &task(),
            )
            .await
            .unwrap_err();

        match err {
            TriggerError::Gate(rejection) => {
                assert_eq!(rejection.agent_id, "second");
                assert_eq!(rejection.reason, "spec too vague");
            }
            other => panic!("Expected Gate, got {other:?}"),
        }
        // Third trigger was never invoked.
        assert_eq!(executor.calls(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_before_phase_infra_failure_is_fail_open() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .fail("flaky", "connection refused")
                .approve("after", "ok"),
        );
        let runner = TriggerRunner::new(executor.clone());

        let triggers = vec![
            TriggerDef::gate("flaky"),
            TriggerDef::gate("after").with_output_variable("OUT"),
        ];
        let vars = runner
            .run_before_phase(
                &CancellationToken::new(),
                "implement",
                &triggers,
                &VarMap::new(),
                &task(),
            )
            .await
            .unwrap();

        assert_eq!(executor.calls(), vec!["flaky", "after"]);
        assert_eq!(vars.get("OUT").map(String::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn test_disabled_and_empty_agent_triggers_skipped() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = TriggerRunner::new(executor.clone());

        let triggers = vec![
            TriggerDef::gate("skipped").disabled(),
            TriggerDef::gate(""),
        ];
        runner
            .run_before_phase(
                &CancellationToken::new(),
                "implement",
                &triggers,
                &VarMap::new(),
                &task(),
            )
            .await
            .unwrap();

        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reaction_does_not_block() {
        let mut executor = ScriptedExecutor::new();
        executor.delay = Some(Duration::from_secs(30));
        let runner = TriggerRunner::new(Arc::new(executor));

        let triggers = vec![TriggerDef::reaction("slow-reaction")];
        let started = std::time::Instant::now();
        runner
            .run_before_phase(
                &CancellationToken::new(),
                "implement",
                &triggers,
                &VarMap::new(),
                &task(),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_lifecycle_infra_failure_surfaces() {
        let executor = Arc::new(ScriptedExecutor::new().fail("hook", "boom"));
        let runner = TriggerRunner::new(executor);

        let triggers = vec![TriggerDef::gate("hook").on_event(TriggerEvent::TaskCompleted)];
        let err = runner
            .run_lifecycle(
                &CancellationToken::new(),
                TriggerEvent::TaskCompleted,
                &triggers,
                &task(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Infra(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_filters_by_event() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = TriggerRunner::new(executor.clone());

        let triggers = vec![
            TriggerDef::gate("on-complete").on_event(TriggerEvent::TaskCompleted),
            TriggerDef::gate("on-failed").on_event(TriggerEvent::TaskFailed),
        ];
        runner
            .run_lifecycle(
                &CancellationToken::new(),
                TriggerEvent::TaskFailed,
                &triggers,
                &task(),
            )
            .await
            .unwrap();

        assert_eq!(executor.calls(), vec!["on-failed"]);
    }

    #[tokio::test]
    async fn test_initiative_planned_carries_context() {
        struct CapturingExecutor {
            last: Mutex<Option<TriggerInput>>,
        }

        #[async_trait]
        impl TriggerExecutor for CapturingExecutor {
            async fn evaluate(&self, _agent_id: &str, input: TriggerInput) -> Result<TriggerResult> {
                *self.last.lock().unwrap() = Some(input);
                Ok(TriggerResult {
                    approved: true,
                    reason: String::new(),
                    output: String::new(),
                    parse_error: None,
                })
            }
        }

        let executor = Arc::new(CapturingExecutor {
            last: Mutex::new(None),
        });
        let runner = TriggerRunner::new(executor.clone());

        let triggers = vec![TriggerDef::gate("planner").on_event(TriggerEvent::InitiativePlanned)];
        runner
            .run_initiative_planned(
                &CancellationToken::new(),
                &triggers,
                "init-1",
                &["task-1".into(), "task-2".into()],
            )
            .await
            .unwrap();

        let input = executor.last.lock().unwrap().clone().unwrap();
        assert_eq!(input.extra.get("initiative_id"), Some(&json!("init-1")));
        assert_eq!(input.extra.get("task_ids"), Some(&json!(["task-1", "task-2"])));
    }

    #[tokio::test]
    async fn test_gate_cancellation_yields_cancelled() {
        let mut executor = ScriptedExecutor::new();
        executor.delay = Some(Duration::from_secs(30));
        let runner = TriggerRunner::new(Arc::new(executor));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let triggers = vec![TriggerDef::gate("slow")];
        let err = runner
            .run_before_phase(&cancel, "implement", &triggers, &VarMap::new(), &task())
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Cancelled));
    }

    #[tokio::test]
    async fn test_gate_events_published() {
        let bus = Arc::new(EventBus::default());
        let executor = Arc::new(ScriptedExecutor::new().approve("auditor", ""));
        let runner = TriggerRunner::new(executor).with_events(bus.clone());

        let mut rx = bus.subscribe("task-1");
        let triggers = vec![TriggerDef::gate("auditor")];
        runner
            .run_before_phase(
                &CancellationToken::new(),
                "implement",
                &triggers,
                &VarMap::new(),
                &task(),
            )
            .await
            .unwrap();

        let started = rx.try_recv().unwrap();
        assert_eq!(started.kind, EventKind::TriggerStarted);
        assert_eq!(started.data.get("agent_id"), Some(&json!("auditor")));
        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.kind, EventKind::TriggerCompleted);
        assert_eq!(completed.data.get("approved"), Some(&json!(true)));
    }
}
