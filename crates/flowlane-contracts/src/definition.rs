//! Workflow definitions: the graph a version freezes and an instance walks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// A workflow definition: the immutable body of a version.
///
/// `steps` maps a step name to its spec; `start_at` names the entry step.
/// The graph is acyclic by construction — nothing in this crate enforces
/// that, it is a property definitions are expected to hold when created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub start_at: String,
    pub steps: HashMap<String, StepSpec>,

    /// Binds this definition to an external trigger, if it is started by one
    /// rather than by a direct API call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerBinding>,
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.get(name)
    }
}

/// Binding of a workflow definition to an external trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerBinding {
    pub connector_id: String,
    pub trigger_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One node in a workflow graph.
///
/// `next` names the step to transition to on completion, or `"end"`
/// (equivalently `None`) to terminate the instance successfully.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    /// Invoke an action handler.
    Action {
        action_id: String,
        #[serde(default)]
        config: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },

    /// Pause for a fixed duration, then advance to `next`.
    Delay {
        duration_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },

    /// Evaluate a condition against instance data and pick a successor.
    Branch {
        condition: Condition,
        on_true: String,
        on_false: String,
    },

    /// Suspend until an external event arrives, or until `timeout_seconds`
    /// elapses (whichever comes first).
    WaitForEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
}

impl StepSpec {
    /// The step's declared successor, if any (`None` means "end").
    pub fn next(&self) -> Option<&str> {
        match self {
            Self::Action { next, .. } | Self::Delay { next, .. } | Self::WaitForEvent { next, .. } => {
                next.as_deref()
            }
            Self::Branch { .. } => None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Action { retry, .. } => retry.clone().unwrap_or_default(),
            _ => RetryPolicy::default(),
        }
    }
}

/// Business-level retry policy attached to a step.
///
/// Distinct from the engine's internal reliability `RetryPolicy` (exponential
/// backoff with jitter, used for infrastructure-level redelivery): this one
/// describes how many times a *step* may re-attempt before the instance is
/// marked failed, with a flat delay between attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_delay_seconds")]
    pub delay_seconds: u64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        1
    }

    fn default_delay_seconds() -> u64 {
        5
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            delay_seconds: Self::default_delay_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_step_serde_round_trip() {
        let step = StepSpec::Action {
            action_id: "http".into(),
            config: json!({"url": "https://example.com"}),
            connection_id: None,
            next: Some("b".into()),
            retry: Some(RetryPolicy {
                max_attempts: 3,
                delay_seconds: 1,
            }),
        };

        let text = serde_json::to_string(&step).unwrap();
        assert!(text.contains("\"type\":\"action\""));
        let parsed: StepSpec = serde_json::from_str(&text).unwrap();
        assert_eq!(step, parsed);
    }

    #[test]
    fn default_retry_policy_is_single_attempt() {
        let step = StepSpec::Action {
            action_id: "http".into(),
            config: json!({}),
            connection_id: None,
            next: None,
            retry: None,
        };
        assert_eq!(step.retry_policy(), RetryPolicy::default());
        assert_eq!(step.retry_policy().max_attempts, 1);
    }

    #[test]
    fn next_is_none_for_branch() {
        let step = StepSpec::Branch {
            condition: Condition {
                field: "x".into(),
                operator: crate::condition::ConditionOperator::Exists,
                value: serde_json::Value::Null,
            },
            on_true: "t".into(),
            on_false: "f".into(),
        };
        assert_eq!(step.next(), None);
    }
}
