//! Messages carried on the orchestration queue.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event consumed by the orchestrator.
///
/// These are the only three inputs the orchestrator reacts to; everything
/// else (branching, delays, retries) is derived internally from the
/// definition and current instance state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StartWorkflow { instance_id: Uuid },

    StepComplete {
        instance_id: Uuid,
        step_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    StepFailed {
        instance_id: Uuid,
        step_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

impl WorkflowEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::StartWorkflow { instance_id }
            | Self::StepComplete { instance_id, .. }
            | Self::StepFailed { instance_id, .. } => *instance_id,
        }
    }

    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::StartWorkflow { .. } => None,
            Self::StepComplete { step_name, .. } | Self::StepFailed { step_name, .. } => {
                Some(step_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_serialization() {
        let event = WorkflowEvent::StepComplete {
            instance_id: Uuid::nil(),
            step_name: "a".into(),
            data: Some(json!({"ok": true})),
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"type\":\"step_complete\""));
        let parsed: WorkflowEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn start_workflow_has_no_step_name() {
        let event = WorkflowEvent::StartWorkflow {
            instance_id: Uuid::nil(),
        };
        assert_eq!(event.step_name(), None);
    }
}
