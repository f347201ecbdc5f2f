//! Action queue messages and the handler contract external connectors implement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message consumed by the action worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionMessage {
    pub action: String,
    pub step_name: String,
    pub instance_id: Uuid,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// The outcome of running an action handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionResult {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_data: Option<serde_json::Value>,
    },
    Failure {
        error_message: String,
    },
}

impl ActionResult {
    pub fn success(updated_data: Option<serde_json::Value>) -> Self {
        Self::Success { updated_data }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self::Failure {
            error_message: error_message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Error raised by an action handler invocation.
///
/// Distinct from [`ActionResult::Failure`]: this is an infrastructure-level
/// failure to invoke the handler at all (panic, I/O error, handler not
/// found), whereas `ActionResult::Failure` is the handler's own reported
/// business outcome. The worker converts both into a `StepFailed` event.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action handler panicked or returned an unexpected error: {0}")]
    Internal(String),

    #[error("handler timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// A pure(ish) function of `(instance_id, data, config) -> ActionResult`.
///
/// Handlers may perform blocking I/O but must respect a bounded timeout;
/// they must not write workflow state directly — only the returned
/// `updated_data` survives into the instance.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(
        &self,
        instance_id: Uuid,
        data: &serde_json::Value,
        config: &serde_json::Value,
    ) -> Result<ActionResult, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_result_tagged_serialization() {
        let result = ActionResult::success(Some(json!({"x": 1})));
        let text = serde_json::to_string(&result).unwrap();
        assert!(text.contains("\"status\":\"success\""));
        let parsed: ActionResult = serde_json::from_str(&text).unwrap();
        assert_eq!(result, parsed);
    }

    #[test]
    fn failure_is_not_success() {
        assert!(!ActionResult::failure("boom").is_success());
    }
}
