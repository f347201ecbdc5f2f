//! Core persisted types: workflows, versions, instances, step executions,
//! outbox rows, and connections.

use chrono::{DateTime, Utc};
use flowlane_contracts::WorkflowDefinition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A named container for versions. Only the active version drives new
/// instances; older versions remain addressable for instances already
/// running against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub active_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An immutable snapshot of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
}

/// One execution of a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub version_id: Uuid,
    pub status: InstanceStatus,
    pub current_step: Option<String>,
    pub current_step_attempts: i32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: Uuid, version_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            version_id,
            status: InstanceStatus::Pending,
            current_step: None,
            current_step_attempts: 0,
            data: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge `patch`'s keys into `data`, overwriting on collision.
    pub fn merge_data(&mut self, patch: &serde_json::Value) {
        let (Some(existing), Some(incoming)) = (self.data.as_object_mut(), patch.as_object()) else {
            return;
        };
        for (key, value) in incoming {
            existing.insert(key.clone(), value.clone());
        }
    }
}

/// One attempt at one step for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_name: String,
    pub status: StepStatus,
    pub attempt: i32,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A durable intent: a message that the outbox relay will eventually
/// deliver to `destination`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub destination: String,
    pub payload: serde_json::Value,
    pub publish_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub request_id: Option<String>,
}

pub const ORCHESTRATION_QUEUE: &str = "orchestration_queue";
pub const ACTIONS_QUEUE: &str = "actions_queue";

/// A stored credential bundle referenced by steps via `connection_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub connector_id: String,
    pub name: String,
    pub config: serde_json::Value,
}
