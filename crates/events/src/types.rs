//! Event types for the SCORCH event system

use chrono::{DateTime, Utc};
use scorch_core::{ComponentStatus, Stage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Policy guarding pipeline, component and run events.
pub const SCORCH_POLICY: &str = "experiments/scorch";
/// Policy guarding terminal lifecycle events.
pub const TERMINAL_POLICY: &str = "experiments/scorch/terminals";

/// The resource an event is scoped to, e.g. `pipeline` / `exp/0/1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Resource {
    pub kind: String,
    pub name: String,
}

impl Resource {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn pipeline(experiment: &str, run: usize, loop_index: usize) -> Self {
        Self::new("pipeline", pipeline_key(experiment, run, loop_index))
    }
}

/// Resource key of a pipeline graph: `experiment/run/loop`.
pub fn pipeline_key(experiment: &str, run: usize, loop_index: usize) -> String {
    format!("{}/{}/{}", experiment, run, loop_index)
}

/// Envelope wrapping all events with routing metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Policy a viewer must hold to receive the event
    pub policy: String,
    /// Resource the event is scoped to
    pub resource: Resource,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new envelope, deriving policy and resource from the event
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            policy: event.policy().to_string(),
            resource: event.resource(),
            event,
        }
    }

    /// The JSON payload handed to subscribers.
    pub fn payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.event)
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run was accepted and started executing
    #[serde(rename = "run.started")]
    RunStarted { experiment: String, run: usize },

    /// A run finished, successfully or not
    #[serde(rename = "run.finished")]
    RunFinished {
        experiment: String,
        run: usize,
        success: bool,
        error: Option<String>,
    },

    /// A pipeline graph was built or mutated
    #[serde(rename = "pipeline.updated")]
    PipelineUpdated {
        experiment: String,
        run: usize,
        #[serde(rename = "loop")]
        loop_index: usize,
        pipeline: serde_json::Value,
    },

    /// A component reported a status transition
    #[serde(rename = "component.status")]
    ComponentStatus {
        experiment: String,
        run: usize,
        #[serde(rename = "loop")]
        loop_index: usize,
        count: usize,
        stage: Stage,
        name: String,
        status: ComponentStatus,
    },

    /// A breakpoint spawned an interactive terminal
    #[serde(rename = "terminal.created")]
    TerminalCreated {
        experiment: String,
        run: usize,
        #[serde(rename = "loop")]
        loop_index: usize,
        stage: Stage,
        name: String,
        pid: u32,
    },

    /// A breakpoint terminal process exited
    #[serde(rename = "terminal.exited")]
    TerminalExited { experiment: String, pid: u32 },

    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the experiment associated with this event, if any
    pub fn experiment(&self) -> Option<&str> {
        match self {
            Event::RunStarted { experiment, .. }
            | Event::RunFinished { experiment, .. }
            | Event::PipelineUpdated { experiment, .. }
            | Event::ComponentStatus { experiment, .. }
            | Event::TerminalCreated { experiment, .. }
            | Event::TerminalExited { experiment, .. } => Some(experiment),
            Event::Error { .. } => None,
        }
    }

    pub fn policy(&self) -> &'static str {
        match self {
            Event::TerminalCreated { .. } | Event::TerminalExited { .. } => TERMINAL_POLICY,
            _ => SCORCH_POLICY,
        }
    }

    pub fn resource(&self) -> Resource {
        match self {
            Event::RunStarted { experiment, run } | Event::RunFinished { experiment, run, .. } => {
                Resource::new("run", format!("{}/{}", experiment, run))
            }
            Event::PipelineUpdated {
                experiment,
                run,
                loop_index,
                ..
            }
            | Event::ComponentStatus {
                experiment,
                run,
                loop_index,
                ..
            } => Resource::pipeline(experiment, *run, *loop_index),
            Event::TerminalCreated { experiment, pid, .. }
            | Event::TerminalExited { experiment, pid } => {
                Resource::new("terminal", format!("{}/{}", experiment, pid))
            }
            Event::Error { .. } => Resource::new("error", ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::new(Event::RunStarted {
            experiment: "exp".to_string(),
            run: 0,
        });

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
        assert_eq!(envelope.policy, SCORCH_POLICY);
        assert_eq!(envelope.resource, Resource::new("run", "exp/0"));
    }

    #[test]
    fn test_pipeline_resource_key() {
        let event = Event::PipelineUpdated {
            experiment: "exp".to_string(),
            run: 1,
            loop_index: 2,
            pipeline: serde_json::json!({}),
        };
        assert_eq!(event.resource(), Resource::new("pipeline", "exp/1/2"));
    }

    #[test]
    fn test_terminal_events_use_terminal_policy() {
        let event = Event::TerminalExited {
            experiment: "exp".to_string(),
            pid: 42,
        };
        assert_eq!(event.policy(), TERMINAL_POLICY);
        assert_eq!(event.resource().name, "exp/42");
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::ComponentStatus {
            experiment: "exp".to_string(),
            run: 0,
            loop_index: 0,
            count: 1,
            stage: Stage::Start,
            name: "pause".to_string(),
            status: ComponentStatus::Background,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("component.status"));
        assert!(json.contains("\"loop\":0"));
        assert!(json.contains("\"status\":\"background\""));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"terminal.exited","experiment":"exp","pid":7}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::TerminalExited { experiment, pid } => {
                assert_eq!(experiment, "exp");
                assert_eq!(pid, 7);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_experiment() {
        let event = Event::RunStarted {
            experiment: "exp".to_string(),
            run: 0,
        };
        assert_eq!(event.experiment(), Some("exp"));

        let error_event = Event::Error {
            message: "test".to_string(),
            context: None,
        };
        assert_eq!(error_event.experiment(), None);
    }
}
