//! The orchestrator: interprets a workflow definition and advances an
//! instance's state machine one event at a time, under a per-instance lock,
//! writing state and outbox rows together in one transaction.

use std::sync::Arc;

use chrono::Utc;
use flowlane_contracts::{StepSpec, WorkflowDefinition, WorkflowEvent};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::{Instance, InstanceStatus, StepExecution, StepStatus, ACTIONS_QUEUE, ORCHESTRATION_QUEUE};
use crate::lock::{InstanceLock, LockError, DEFAULT_LEASE};
use crate::persistence::{NewOutboxMessage, OrchestrationTx, StoreError, WorkflowStore};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Another consumer already holds the instance lock. Distinguished from
    /// `Retryable` so callers can apply the tighter, more patient lock-contention
    /// backoff instead of the one for unexpected errors.
    #[error("lock contention: {0}")]
    LockContention(String),

    /// The broker should redeliver this event: a transient infrastructure
    /// fault, not lock contention.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The broker should dead-letter this event; redelivery cannot help.
    #[error("non-retryable: {0}")]
    NonRetryable(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        // A store error inside a transaction is treated as an infrastructure
        // hiccup unless it names a missing row, which no retry will fix.
        match err {
            StoreError::InstanceNotFound(_)
            | StoreError::VersionNotFound(_)
            | StoreError::ConnectionNotFound(_) => Self::NonRetryable(err.to_string()),
            StoreError::Database(_) | StoreError::Serialization(_) => Self::Retryable(err.to_string()),
        }
    }
}

impl From<LockError> for OrchestratorError {
    fn from(err: LockError) -> Self {
        Self::Retryable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Event ignored: instance already terminal, or the event was stale.
    Ignored,
    /// The instance advanced but did not reach a terminal state.
    Advanced,
    /// The instance reached `completed` or `failed` as a result of this event.
    Terminated(InstanceStatus),
}

/// Drives instances forward one event at a time.
///
/// Generic over the store and lock ports (not boxed) so the hot path is
/// monomorphized; callers that need a uniform type across binaries can still
/// instantiate with `Arc<dyn WorkflowStore>` / `Arc<dyn InstanceLock>`.
pub struct Orchestrator<S, L> {
    store: Arc<S>,
    lock: Arc<L>,
}

impl<S, L> Orchestrator<S, L>
where
    S: WorkflowStore,
    L: InstanceLock,
{
    pub fn new(store: Arc<S>, lock: Arc<L>) -> Self {
        Self { store, lock }
    }

    #[instrument(skip(self, event), fields(instance_id = %event.instance_id()))]
    pub async fn process_event(&self, event: &WorkflowEvent) -> Result<ProcessOutcome, OrchestratorError> {
        let instance_id = event.instance_id();

        let guard = self
            .lock
            .try_acquire(instance_id, DEFAULT_LEASE)
            .await?
            .ok_or_else(|| OrchestratorError::LockContention(format!("lock held for instance {instance_id}")))?;

        let result = self.process_event_locked(event).await;

        if let Err(release_err) = self.lock.release(guard).await {
            warn!(error = %release_err, "failed to release instance lock");
        }

        result
    }

    async fn process_event_locked(&self, event: &WorkflowEvent) -> Result<ProcessOutcome, OrchestratorError> {
        let instance_id = event.instance_id();
        let mut tx = self.store.begin().await?;

        let Some((mut instance, version)) = tx.get_instance(instance_id).await? else {
            return Err(OrchestratorError::NonRetryable(format!(
                "instance not found: {instance_id}"
            )));
        };

        if instance.status.is_terminal() {
            tx.commit().await?;
            return Ok(ProcessOutcome::Ignored);
        }

        let outcome = match event {
            WorkflowEvent::StartWorkflow { .. } => {
                self.handle_start(&mut *tx, &mut instance, &version.definition).await?
            }
            WorkflowEvent::StepComplete { step_name, data, .. } => {
                self.handle_step_complete(&mut *tx, &mut instance, &version.definition, step_name, data.clone())
                    .await?
            }
            WorkflowEvent::StepFailed { step_name, data, .. } => {
                self.handle_step_failed(&mut *tx, &mut instance, &version.definition, step_name, data.clone())
                    .await?
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn handle_start(
        &self,
        tx: &mut dyn OrchestrationTx,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        if instance.status != InstanceStatus::Pending {
            debug!("ignoring duplicate StartWorkflow");
            return Ok(ProcessOutcome::Ignored);
        }
        let start_at = definition.start_at.clone();
        self.transition_to_step(tx, instance, definition, Some(&start_at)).await
    }

    async fn handle_step_complete(
        &self,
        tx: &mut dyn OrchestrationTx,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
        step_name: &str,
        data: Option<serde_json::Value>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        if instance.current_step.as_deref() != Some(step_name) {
            debug!(step_name, "ignoring stale StepComplete");
            return Ok(ProcessOutcome::Ignored);
        }

        if let Some(mut execution) = tx.get_latest_step_execution(instance.id, step_name).await? {
            execution.status = StepStatus::Completed;
            execution.output = data.clone();
            execution.completed_at = Some(Utc::now());
            tx.update_step_execution(&execution).await?;
        }

        if let Some(data) = &data {
            instance.merge_data(data);
        }

        let Some(step) = definition.step(step_name) else {
            return Err(OrchestratorError::NonRetryable(format!(
                "step not found in definition: {step_name}"
            )));
        };
        let next = step.next().map(str::to_string);
        self.transition_to_step(tx, instance, definition, next.as_deref()).await
    }

    async fn handle_step_failed(
        &self,
        tx: &mut dyn OrchestrationTx,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
        step_name: &str,
        data: Option<serde_json::Value>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        if instance.current_step.as_deref() != Some(step_name) {
            debug!(step_name, "ignoring stale StepFailed");
            return Ok(ProcessOutcome::Ignored);
        }

        let Some(step) = definition.step(step_name) else {
            return Err(OrchestratorError::NonRetryable(format!(
                "step not found in definition: {step_name}"
            )));
        };
        let retry = step.retry_policy();

        let error_message = data
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error")
            .to_string();

        if instance.current_step_attempts < retry.max_attempts as i32 {
            if let Some(mut execution) = tx.get_latest_step_execution(instance.id, step_name).await? {
                execution.status = StepStatus::Failed;
                execution.error = Some(error_message.clone());
                execution.completed_at = Some(Utc::now());
                tx.update_step_execution(&execution).await?;
            }

            instance.current_step_attempts += 1;
            instance.updated_at = Utc::now();
            tx.save_instance(instance).await?;

            let next_execution = StepExecution {
                id: Uuid::now_v7(),
                instance_id: instance.id,
                step_name: step_name.to_string(),
                status: StepStatus::Pending,
                attempt: instance.current_step_attempts,
                input: instance.data.clone(),
                output: None,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            tx.insert_step_execution(&next_execution).await?;

            let payload = serde_json::json!({
                "action": action_id_of(step),
                "step_name": step_name,
                "instance_id": instance.id,
                "config": config_of(step),
                "connection_id": connection_id_of(step),
            });
            tx.insert_outbox(
                NewOutboxMessage::new(ACTIONS_QUEUE, payload)
                    .delayed_until(Utc::now() + chrono::Duration::seconds(retry.delay_seconds as i64)),
            )
            .await?;

            return Ok(ProcessOutcome::Advanced);
        }

        if let Some(mut execution) = tx.get_latest_step_execution(instance.id, step_name).await? {
            execution.status = StepStatus::Failed;
            execution.error = Some(error_message);
            execution.completed_at = Some(Utc::now());
            tx.update_step_execution(&execution).await?;
        }

        instance.status = InstanceStatus::Failed;
        instance.updated_at = Utc::now();
        tx.save_instance(instance).await?;

        Ok(ProcessOutcome::Terminated(InstanceStatus::Failed))
    }

    /// Transition the instance to `target` (or end it if `target` is `None`
    /// or `"end"`), recursing through `branch` steps.
    #[async_recursion::async_recursion]
    async fn transition_to_step(
        &self,
        tx: &mut dyn OrchestrationTx,
        instance: &mut Instance,
        definition: &WorkflowDefinition,
        target: Option<&str>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let Some(target) = target.filter(|t| *t != "end") else {
            instance.status = InstanceStatus::Completed;
            instance.current_step = None;
            instance.updated_at = Utc::now();
            tx.save_instance(instance).await?;
            return Ok(ProcessOutcome::Terminated(InstanceStatus::Completed));
        };

        let Some(step) = definition.step(target) else {
            return Err(OrchestratorError::NonRetryable(format!(
                "step not found in definition: {target}"
            )));
        };

        instance.status = InstanceStatus::Running;
        instance.current_step = Some(target.to_string());
        instance.current_step_attempts = 1;
        instance.updated_at = Utc::now();
        tx.save_instance(instance).await?;

        let execution = StepExecution {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            step_name: target.to_string(),
            status: StepStatus::Pending,
            attempt: 1,
            input: instance.data.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        tx.insert_step_execution(&execution).await?;

        match step {
            StepSpec::Action {
                action_id,
                config,
                connection_id,
                ..
            } => {
                let payload = serde_json::json!({
                    "action": action_id,
                    "step_name": target,
                    "instance_id": instance.id,
                    "config": config,
                    "connection_id": connection_id,
                });
                tx.insert_outbox(NewOutboxMessage::new(ACTIONS_QUEUE, payload)).await?;
                Ok(ProcessOutcome::Advanced)
            }

            StepSpec::Delay { duration_seconds, .. } => {
                let mut completed = execution.clone();
                completed.status = StepStatus::Completed;
                completed.completed_at = Some(Utc::now());
                tx.update_step_execution(&completed).await?;

                let payload = serde_json::json!({
                    "type": "step_complete",
                    "instance_id": instance.id,
                    "step_name": target,
                });
                tx.insert_outbox(
                    NewOutboxMessage::new(ORCHESTRATION_QUEUE, payload).delayed_until(
                        Utc::now() + chrono::Duration::seconds(*duration_seconds as i64),
                    ),
                )
                .await?;
                Ok(ProcessOutcome::Advanced)
            }

            StepSpec::Branch {
                condition,
                on_true,
                on_false,
            } => {
                let branch_result = condition.evaluate(&instance.data);
                let next_step = if branch_result { on_true } else { on_false };

                let mut completed = execution.clone();
                completed.status = StepStatus::Completed;
                completed.output = Some(serde_json::json!({
                    "branch_result": branch_result,
                    "next_step": next_step,
                }));
                completed.completed_at = Some(Utc::now());
                tx.update_step_execution(&completed).await?;

                self.transition_to_step(tx, instance, definition, Some(next_step)).await
            }

            StepSpec::WaitForEvent { timeout_seconds, .. } => {
                let mut running = execution.clone();
                running.status = StepStatus::Running;
                tx.update_step_execution(&running).await?;

                if let Some(timeout) = timeout_seconds {
                    let payload = serde_json::json!({
                        "type": "step_failed",
                        "instance_id": instance.id,
                        "step_name": target,
                        "data": {"error": format!("Wait step '{target}' timed out after {timeout}s")},
                    });
                    tx.insert_outbox(
                        NewOutboxMessage::new(ORCHESTRATION_QUEUE, payload)
                            .delayed_until(Utc::now() + chrono::Duration::seconds(*timeout as i64)),
                    )
                    .await?;
                }
                Ok(ProcessOutcome::Advanced)
            }
        }
    }
}

fn action_id_of(step: &StepSpec) -> &str {
    match step {
        StepSpec::Action { action_id, .. } => action_id,
        _ => "",
    }
}

fn config_of(step: &StepSpec) -> serde_json::Value {
    match step {
        StepSpec::Action { config, .. } => config.clone(),
        _ => serde_json::json!({}),
    }
}

fn connection_id_of(step: &StepSpec) -> Option<&str> {
    match step {
        StepSpec::Action { connection_id, .. } => connection_id.as_deref(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Version as DomainVersion;
    use crate::lock::InMemoryLock;
    use crate::persistence::InMemoryWorkflowStore;
    use flowlane_contracts::condition::ConditionOperator;
    use flowlane_contracts::Condition;
    use std::collections::HashMap;

    fn def(start_at: &str, steps: Vec<(&str, StepSpec)>) -> WorkflowDefinition {
        WorkflowDefinition {
            start_at: start_at.into(),
            steps: steps.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            trigger: None,
        }
    }

    fn action(next: Option<&str>, retry: Option<flowlane_contracts::RetryPolicy>) -> StepSpec {
        StepSpec::Action {
            action_id: "log".into(),
            config: serde_json::json!({}),
            connection_id: None,
            next: next.map(str::to_string),
            retry,
        }
    }

    async fn setup(
        definition: WorkflowDefinition,
    ) -> (
        Orchestrator<InMemoryWorkflowStore, InMemoryLock>,
        Arc<InMemoryWorkflowStore>,
        Uuid,
    ) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let version = DomainVersion {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            definition,
            created_at: Utc::now(),
        };
        store.insert_version(version.clone());
        let instance = Instance::new(Uuid::now_v7(), version.id);
        let instance_id = instance.id;
        store.create_instance(instance).await.unwrap();

        let lock = Arc::new(InMemoryLock::new());
        (Orchestrator::new(store.clone(), lock), store, instance_id)
    }

    #[tokio::test]
    async fn linear_success_reaches_completed() {
        let definition = def(
            "a",
            vec![("a", action(Some("b"), None)), ("b", action(None, None))],
        );
        let (orch, store, instance_id) = setup(definition).await;

        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();
        assert_eq!(store.outbox().len(), 1);

        orch.process_event(&WorkflowEvent::StepComplete {
            instance_id,
            step_name: "a".into(),
            data: None,
        })
        .await
        .unwrap();

        let outcome = orch
            .process_event(&WorkflowEvent::StepComplete {
                instance_id,
                step_name: "b".into(),
                data: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Terminated(InstanceStatus::Completed));
        let (instance, _) = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn stale_step_complete_is_ignored() {
        let definition = def(
            "a",
            vec![("a", action(Some("b"), None)), ("b", action(None, None))],
        );
        let (orch, store, instance_id) = setup(definition).await;
        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();

        // Event for a step that is not current_step.
        let outcome = orch
            .process_event(&WorkflowEvent::StepComplete {
                instance_id,
                step_name: "b".into(),
                data: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Ignored);
        let (instance, _) = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.current_step.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn retry_then_exhaustion_fails_instance() {
        let retry = Some(flowlane_contracts::RetryPolicy {
            max_attempts: 2,
            delay_seconds: 0,
        });
        let definition = def("a", vec![("a", action(None, retry))]);
        let (orch, store, instance_id) = setup(definition).await;
        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();

        let outcome = orch
            .process_event(&WorkflowEvent::StepFailed {
                instance_id,
                step_name: "a".into(),
                data: Some(serde_json::json!({"error": "boom"})),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Advanced);

        let outcome = orch
            .process_event(&WorkflowEvent::StepFailed {
                instance_id,
                step_name: "a".into(),
                data: Some(serde_json::json!({"error": "boom again"})),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Terminated(InstanceStatus::Failed));

        let (instance, _) = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);

        let mut executions = store.step_executions(instance_id);
        executions.sort_by_key(|e| e.attempt);
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].attempt, 1);
        assert_eq!(executions[0].status, StepStatus::Failed);
        assert_eq!(executions[1].attempt, 2);
        assert_eq!(executions[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn retry_then_success_leaves_distinct_execution_per_attempt() {
        let retry = Some(flowlane_contracts::RetryPolicy {
            max_attempts: 3,
            delay_seconds: 0,
        });
        let definition = def("a", vec![("a", action(None, retry))]);
        let (orch, store, instance_id) = setup(definition).await;
        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();

        orch.process_event(&WorkflowEvent::StepFailed {
            instance_id,
            step_name: "a".into(),
            data: Some(serde_json::json!({"error": "boom"})),
        })
        .await
        .unwrap();

        orch.process_event(&WorkflowEvent::StepFailed {
            instance_id,
            step_name: "a".into(),
            data: Some(serde_json::json!({"error": "boom again"})),
        })
        .await
        .unwrap();

        let outcome = orch
            .process_event(&WorkflowEvent::StepComplete {
                instance_id,
                step_name: "a".into(),
                data: Some(serde_json::json!({"ok": true})),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Terminated(InstanceStatus::Completed));

        let mut executions = store.step_executions(instance_id);
        executions.sort_by_key(|e| e.attempt);
        assert_eq!(executions.len(), 3);
        assert_eq!(executions[0].attempt, 1);
        assert_eq!(executions[0].status, StepStatus::Failed);
        assert_eq!(executions[1].attempt, 2);
        assert_eq!(executions[1].status, StepStatus::Failed);
        assert_eq!(executions[2].attempt, 3);
        assert_eq!(executions[2].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn branch_picks_true_or_false_successor() {
        let definition = def(
            "b",
            vec![
                (
                    "b",
                    StepSpec::Branch {
                        condition: Condition {
                            field: "x.v".into(),
                            operator: ConditionOperator::Gt,
                            value: serde_json::json!(10),
                        },
                        on_true: "t".into(),
                        on_false: "f".into(),
                    },
                ),
                ("t", action(None, None)),
                ("f", action(None, None)),
            ],
        );
        let (orch, store, instance_id) = setup(definition).await;
        {
            let (mut instance, _) = store.get_instance(instance_id).await.unwrap().unwrap();
            instance.data = serde_json::json!({"x": {"v": 20}});
            store.create_instance(instance).await.unwrap();
        }

        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();

        let (instance, _) = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.current_step.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn delay_step_schedules_self_event_without_action_dispatch() {
        let definition = def(
            "d",
            vec![
                (
                    "d",
                    StepSpec::Delay {
                        duration_seconds: 2,
                        next: Some("b".into()),
                    },
                ),
                ("b", action(None, None)),
            ],
        );
        let (orch, store, instance_id) = setup(definition).await;
        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();

        let outbox = store.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].destination, ORCHESTRATION_QUEUE);
    }

    #[tokio::test]
    async fn wait_for_event_schedules_timeout_then_external_event_wins() {
        let definition = def(
            "w",
            vec![
                (
                    "w",
                    StepSpec::WaitForEvent {
                        timeout_seconds: Some(60),
                        next: Some("b".into()),
                    },
                ),
                ("b", action(None, None)),
            ],
        );
        let (orch, store, instance_id) = setup(definition).await;
        orch.process_event(&WorkflowEvent::StartWorkflow { instance_id })
            .await
            .unwrap();

        // External completion arrives before the timeout self-event.
        orch.process_event(&WorkflowEvent::StepComplete {
            instance_id,
            step_name: "w".into(),
            data: None,
        })
        .await
        .unwrap();

        let (instance, _) = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.current_step.as_deref(), Some("b"));

        // The scheduled timeout's StepFailed arrives late and is stale.
        let outcome = orch
            .process_event(&WorkflowEvent::StepFailed {
                instance_id,
                step_name: "w".into(),
                data: Some(serde_json::json!({"error": "timed out"})),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Ignored);
    }
}
