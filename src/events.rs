//! Per-task event broadcasting.
//!
//! Events carry `{type, task_id, data}`. Subscribers register interest in one
//! task identifier and receive only matching events. Each task id gets its own
//! bounded broadcast ring, so a slow subscriber lags and loses the oldest
//! events (drop-oldest policy); publishers never block.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Event types the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    PhaseStarted,
    PhaseComplete,
    /// One line of agent output (streaming).
    IterationOutput,
    QualityCheckResult,
    TriggerStarted,
    TriggerCompleted,
    TriggerFailed,
    StuckDetected,
    Complete,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStarted => "task_started",
            EventKind::PhaseStarted => "phase_started",
            EventKind::PhaseComplete => "phase_complete",
            EventKind::IterationOutput => "iteration_output",
            EventKind::QualityCheckResult => "quality_check_result",
            EventKind::TriggerStarted => "trigger_started",
            EventKind::TriggerCompleted => "trigger_completed",
            EventKind::TriggerFailed => "trigger_failed",
            EventKind::StuckDetected => "stuck_detected",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A progress event scoped to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, task_id: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Write-many / subscribe-many broadcaster with per-task channels.
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to subscribers of its task id. Never blocks; events
    /// for tasks nobody has subscribed to yet are dropped by the ring once
    /// capacity is exceeded.
    pub fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(event.task_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        // A send error only means no live receivers.
        let _ = sender.send(event);
    }

    /// Subscribe to events for one task id.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<Event> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop all channels; subscribers observe stream end.
    pub fn close(&self) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_uses_type_field() {
        let event = Event::new(EventKind::PhaseStarted, "task-1").with("phase", json!("implement"));
        let rendered = serde_json::to_string(&event).unwrap();
        assert!(rendered.contains("\"type\":\"phase_started\""));
        assert!(rendered.contains("\"task_id\":\"task-1\""));
        assert!(rendered.contains("\"phase\":\"implement\""));
    }

    #[tokio::test]
    async fn test_subscriber_receives_only_its_task() {
        let bus = EventBus::default();
        let mut rx_a = bus.subscribe("task-a");
        let mut rx_b = bus.subscribe("task-b");

        bus.publish(Event::new(EventKind::TaskStarted, "task-a"));
        bus.publish(Event::new(EventKind::TaskStarted, "task-b"));

        let got_a = rx_a.recv().await.unwrap();
        assert_eq!(got_a.task_id, "task-a");
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_b.task_id, "task-b");

        // No cross-talk left behind.
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_same_task() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe("task-a");
        let mut rx2 = bus.subscribe("task-a");

        bus.publish(Event::new(EventKind::Complete, "task-a"));

        assert_eq!(rx1.recv().await.unwrap().kind, EventKind::Complete);
        assert_eq!(rx2.recv().await.unwrap().kind, EventKind::Complete);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe("task-a");

        for i in 0..5 {
            bus.publish(Event::new(EventKind::IterationOutput, "task-a").with("line", json!(i)));
        }

        // The ring holds the newest two; the first recv reports the lag.
        let first = rx.recv().await;
        assert!(matches!(
            first,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.data.get("line"), Some(&json!(3)));
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(Event::new(EventKind::Error, "ghost"));
    }
}
