use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Every kind of event the orchestration engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    IntentReceived,
    AnalysisStarted,
    AnalysisComplete,
    PlanCreated,
    TodoStarted,
    TodoCompleted,
    TodoFailed,
    TodoRetrying,
    TodoCancelled,
    Progress,
    DecompositionWarning,
    ValidationStarted,
    ValidationPassed,
    ValidationFailed,
    PersistenceFailed,
    WorkflowResumed,
    WorkflowComplete,
    WorkflowFailed,
    WorkflowHalted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::IntentReceived => "intent_received",
            EventType::AnalysisStarted => "analysis_started",
            EventType::AnalysisComplete => "analysis_complete",
            EventType::PlanCreated => "plan_created",
            EventType::TodoStarted => "todo_started",
            EventType::TodoCompleted => "todo_completed",
            EventType::TodoFailed => "todo_failed",
            EventType::TodoRetrying => "todo_retrying",
            EventType::TodoCancelled => "todo_cancelled",
            EventType::Progress => "progress",
            EventType::DecompositionWarning => "decomposition_warning",
            EventType::ValidationStarted => "validation_started",
            EventType::ValidationPassed => "validation_passed",
            EventType::ValidationFailed => "validation_failed",
            EventType::PersistenceFailed => "persistence_failed",
            EventType::WorkflowResumed => "workflow_resumed",
            EventType::WorkflowComplete => "workflow_complete",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowHalted => "workflow_halted",
        }
    }

    /// Events that end a workflow run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowComplete | EventType::WorkflowFailed | EventType::WorkflowHalted
        )
    }

    /// Warnings and failures, as opposed to routine progress.
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            EventType::TodoFailed
                | EventType::TodoRetrying
                | EventType::DecompositionWarning
                | EventType::ValidationFailed
                | EventType::PersistenceFailed
                | EventType::WorkflowFailed
                | EventType::WorkflowHalted
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// The `todo_id` field of `data`, when present.
    pub fn todo_id(&self) -> Option<&str> {
        self.data.get("todo_id").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&EventType::DecompositionWarning).unwrap();
        assert_eq!(json, "\"decomposition_warning\"");
        assert_eq!(EventType::DecompositionWarning.as_str(), "decomposition_warning");
    }

    #[test]
    fn event_carries_data() {
        let ev = WorkflowEvent::new(EventType::TodoStarted, "Inspecting router")
            .with_data(serde_json::json!({ "todo_id": "a", "attempt": 1 }));
        assert_eq!(ev.todo_id(), Some("a"));
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "todo_started");
        let back: WorkflowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn terminal_events() {
        assert!(EventType::WorkflowHalted.is_terminal());
        assert!(!EventType::TodoFailed.is_terminal());
        assert!(EventType::PersistenceFailed.is_problem());
        assert!(!EventType::Progress.is_problem());
    }
}
