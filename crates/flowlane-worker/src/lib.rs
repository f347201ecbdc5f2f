//! # Flowlane Worker
//!
//! The action worker: claims `actions_queue` messages, resolves the step's
//! config against instance data and its connection, dispatches to a
//! registered [`flowlane_contracts::ActionHandler`], and reports the outcome
//! back to the orchestrator as a `step_complete`/`step_failed` event on the
//! orchestration queue.
//!
//! Concurrency, backpressure, and polling reuse the load-aware worker pool
//! design this codebase already uses elsewhere; what's new here is
//! `execute_claimed`'s idempotency check, config merge, and template
//! resolution.

pub mod backpressure;
pub mod handlers;
pub mod poller;
pub mod registry;
pub mod template;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use poller::{ActionPoller, PollerConfig, PollerError};
pub use registry::HandlerRegistry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowlane_contracts::{ActionError, ActionMessage, ActionResult};
use flowlane_engine::domain::ORCHESTRATION_QUEUE;
use flowlane_engine::{
    Broker, BrokerError, ClaimedMessage, NewOutboxMessage, RetryPolicy, StepStatus, StoreError, WorkflowStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    /// Hard upper bound on a single handler invocation. A handler that runs
    /// longer than this is treated as a failure and retried like any other.
    #[serde(with = "duration_millis")]
    pub handler_timeout: Duration,
    pub backpressure: BackpressureConfig,
    pub poller: PollerConfig,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            handler_timeout: Duration::from_secs(30),
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Claims, executes, and reports outcomes for `actions_queue` messages.
pub struct ActionWorker<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    backpressure: Arc<BackpressureState>,
    active_tasks: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S, B> ActionWorker<S, B>
where
    S: WorkflowStore,
    B: Broker,
{
    pub fn new(store: Arc<S>, broker: Arc<B>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(config.backpressure.clone(), config.max_concurrency));
        Self {
            store,
            broker,
            registry: Arc::new(registry),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            backpressure,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signal the run loop to stop accepting new batches once in-flight
    /// tasks drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn backpressure(&self) -> &BackpressureState {
        &self.backpressure
    }

    /// Run the claim/execute loop until shutdown.
    #[instrument(skip(self), fields(%consumer_id))]
    pub async fn run(&self, consumer_id: impl Into<String> + std::fmt::Display + Clone) -> Result<(), WorkerError> {
        let mut poller = ActionPoller::new(
            self.broker.clone(),
            consumer_id.to_string(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );

        loop {
            if poller.is_shutdown() {
                break;
            }

            if !self.backpressure.should_accept() {
                if poller.wait().await {
                    break;
                }
                continue;
            }

            let available = self.backpressure.available_slots();
            if available == 0 {
                if poller.wait().await {
                    break;
                }
                continue;
            }

            let claimed = poller.poll(available).await?;
            if claimed.is_empty() {
                if poller.wait().await {
                    break;
                }
                continue;
            }

            for message in claimed {
                let permit = match self.active_tasks.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                self.backpressure.task_started();

                let store = self.store.clone();
                let broker = self.broker.clone();
                let registry = self.registry.clone();
                let backpressure = self.backpressure.clone();
                let handler_timeout = self.config.handler_timeout;

                tokio::spawn(async move {
                    let message_id = message.id;
                    if let Err(e) = execute_claimed(store.as_ref(), broker.as_ref(), &registry, message, handler_timeout).await {
                        error!(%message_id, error = %e, "failed to process claimed action");
                    }
                    backpressure.task_completed();
                    drop(permit);
                });
            }
        }

        Ok(())
    }
}

/// Execute one claimed action message end to end, then ack/nack it.
///
/// Mirrors the original worker service's `execute_action`: an idempotency
/// check against the latest step execution so a redelivered message after a
/// crash doesn't re-run a handler that already completed, then a connection
/// config merge (connection config as base, step config overriding on
/// collision) before template resolution and dispatch.
async fn execute_claimed<S: WorkflowStore, B: Broker>(
    store: &S,
    broker: &B,
    registry: &HandlerRegistry,
    message: ClaimedMessage,
    handler_timeout: Duration,
) -> Result<(), WorkerError> {
    let action: ActionMessage = match serde_json::from_value(message.payload.clone()) {
        Ok(action) => action,
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "malformed action message, dead-lettering");
            broker.nack(message.id, &format!("malformed payload: {e}"), false, Duration::ZERO).await?;
            return Ok(());
        }
    };

    if already_completed(store, action.instance_id, &action.step_name).await? {
        debug!(instance_id = %action.instance_id, step = %action.step_name, "step already completed, skipping re-execution");
        broker.ack(message.id).await?;
        return Ok(());
    }

    let Some((instance, _version)) = store.get_instance(action.instance_id).await? else {
        warn!(instance_id = %action.instance_id, "instance not found, dead-lettering");
        broker.nack(message.id, "instance not found", false, Duration::ZERO).await?;
        return Ok(());
    };

    let resolved_config = match resolve_action_config(store, &action).await {
        Ok(config) => config,
        Err(e) => {
            nack_with_backoff(broker, message.id, message.attempt, &e.to_string()).await?;
            return Err(e.into());
        }
    };
    let resolved_config = template::resolve_config(&resolved_config, &instance.data);

    let Some(handler) = registry.get(&action.action) else {
        warn!(action = %action.action, "no handler registered for action, dead-lettering");
        broker
            .nack(
                message.id,
                &format!("no handler registered for action: {}", action.action),
                false,
                Duration::ZERO,
            )
            .await?;
        return Ok(());
    };

    let outcome = match tokio::time::timeout(handler_timeout, handler.execute(action.instance_id, &instance.data, &resolved_config)).await {
        Ok(Ok(result)) => result,
        Ok(Err(ActionError::Internal(msg))) => ActionResult::failure(msg),
        Ok(Err(ActionError::Timeout(d))) => ActionResult::failure(format!("handler timed out after {d:?}")),
        Err(_) => ActionResult::failure(format!("handler exceeded {handler_timeout:?} hard limit")),
    };

    report_outcome(store, &action, outcome).await?;
    broker.ack(message.id).await?;
    Ok(())
}

/// Retry policy for unexpected errors while resolving a claimed action
/// (e.g. a transient store failure looking up the action's connection):
/// 10 s backoff, 3 attempts, then dead-letter.
fn unexpected_error_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential()
        .with_initial_interval(Duration::from_secs(10))
        .with_max_attempts(3)
}

/// Nack a claimed message that failed for an unexpected (not dead-letter-on-sight)
/// reason, redelivering with backoff until `unexpected_error_retry_policy` is
/// exhausted, then dead-lettering it.
async fn nack_with_backoff<B: Broker>(broker: &B, message_id: Uuid, attempt: i32, error: &str) -> Result<(), WorkerError> {
    let policy = unexpected_error_retry_policy();
    let attempt = attempt.max(0) as u32;
    if policy.has_attempts_remaining(attempt) {
        let delay = policy.delay_for_attempt(attempt + 1);
        warn!(error = %error, attempt, ?delay, "retryable worker error, redelivering with backoff");
        broker.nack(message_id, error, true, delay).await?;
    } else {
        error!(error = %error, attempt, "retry attempts exhausted, dead-lettering");
        broker.nack(message_id, error, false, Duration::ZERO).await?;
    }
    Ok(())
}

async fn already_completed<S: WorkflowStore>(store: &S, instance_id: Uuid, step_name: &str) -> Result<bool, StoreError> {
    Ok(store
        .get_latest_step_execution(instance_id, step_name)
        .await?
        .is_some_and(|execution| execution.status == StepStatus::Completed))
}

/// Merge the step's own config over its connection's stored config, if any.
async fn resolve_action_config<S: WorkflowStore>(store: &S, action: &ActionMessage) -> Result<serde_json::Value, StoreError> {
    let Some(connection_id) = &action.connection_id else {
        return Ok(action.config.clone());
    };

    let mut tx = store.begin().await?;
    let connection = tx.get_connection(connection_id).await?;
    tx.rollback().await?;

    let Some(connection) = connection else {
        return Ok(action.config.clone());
    };

    let mut merged = connection.config;
    if let (Some(base), Some(overrides)) = (merged.as_object_mut(), action.config.as_object()) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }
    Ok(merged)
}

/// Report the handler's outcome to the orchestrator as a `step_complete` or
/// `step_failed` event on the orchestration queue.
async fn report_outcome<S: WorkflowStore>(store: &S, action: &ActionMessage, outcome: ActionResult) -> Result<(), StoreError> {
    let payload = match outcome {
        ActionResult::Success { updated_data } => serde_json::json!({
            "type": "step_complete",
            "instance_id": action.instance_id,
            "step_name": action.step_name,
            "data": updated_data,
        }),
        ActionResult::Failure { error_message } => serde_json::json!({
            "type": "step_failed",
            "instance_id": action.instance_id,
            "step_name": action.step_name,
            "data": {"error": error_message},
        }),
    };

    let mut tx = store.begin().await?;
    tx.insert_outbox(NewOutboxMessage::new(ORCHESTRATION_QUEUE, payload)).await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlane_engine::domain::{ACTIONS_QUEUE, Connection, Instance};
    use flowlane_engine::{InMemoryBroker, InMemoryWorkflowStore, NewBrokerMessage, Version};
    use flowlane_contracts::WorkflowDefinition;

    fn definition() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "start_at": "log",
            "steps": {
                "log": {"type": "action", "action_id": "log", "config": {}}
            }
        }))
        .unwrap()
    }

    async fn seed_instance(store: &InMemoryWorkflowStore) -> Uuid {
        let version = Version {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            definition: definition(),
            created_at: Utc::now(),
        };
        store.insert_version(version.clone());
        let instance = Instance::new(Uuid::now_v7(), version.id);
        let instance_id = instance.id;
        store.create_instance(instance).await.unwrap();
        instance_id
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler_and_reports_completion() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let instance_id = seed_instance(&store).await;

        let mut registry = HandlerRegistry::new();
        registry.register("log", Arc::new(handlers::LogHandler));

        let action = ActionMessage {
            action: "log".into(),
            step_name: "log".into(),
            instance_id,
            config: serde_json::json!({}),
            connection_id: None,
            request_id: None,
        };
        broker
            .publish(NewBrokerMessage {
                destination: ACTIONS_QUEUE.into(),
                payload: serde_json::to_value(&action).unwrap(),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim(ACTIONS_QUEUE, "w1", 1).await.unwrap();

        execute_claimed(store.as_ref(), broker.as_ref(), &registry, claimed[0].clone(), Duration::from_secs(1))
            .await
            .unwrap();

        let due = store.fetch_due_outbox(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].payload["type"], "step_complete");
    }

    #[tokio::test]
    async fn already_completed_step_is_skipped_without_rerunning_handler() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let instance_id = seed_instance(&store).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_step_execution(&flowlane_engine::StepExecution {
            id: Uuid::now_v7(),
            instance_id,
            step_name: "log".into(),
            status: StepStatus::Completed,
            attempt: 1,
            input: serde_json::json!({}),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register("log", Arc::new(handlers::LogHandler));

        let action = ActionMessage {
            action: "log".into(),
            step_name: "log".into(),
            instance_id,
            config: serde_json::json!({}),
            connection_id: None,
            request_id: None,
        };
        broker
            .publish(NewBrokerMessage {
                destination: ACTIONS_QUEUE.into(),
                payload: serde_json::to_value(&action).unwrap(),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim(ACTIONS_QUEUE, "w1", 1).await.unwrap();

        execute_claimed(store.as_ref(), broker.as_ref(), &registry, claimed[0].clone(), Duration::from_secs(1))
            .await
            .unwrap();

        // No new step_complete/step_failed was reported, since the step had
        // already completed.
        let due = store.fetch_due_outbox(10).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn connection_config_is_base_step_config_overrides() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        store.insert_connection(Connection {
            id: Uuid::nil(),
            connector_id: "http".into(),
            name: "conn".into(),
            config: serde_json::json!({"url": "https://base.example", "timeout": 5}),
        });

        let action = ActionMessage {
            action: "http".into(),
            step_name: "call".into(),
            instance_id: Uuid::now_v7(),
            config: serde_json::json!({"url": "https://override.example"}),
            connection_id: Some(Uuid::nil().to_string()),
            request_id: None,
        };

        let merged = resolve_action_config(store.as_ref(), &action).await.unwrap();
        assert_eq!(merged["url"], serde_json::json!("https://override.example"));
        assert_eq!(merged["timeout"], serde_json::json!(5));
    }

    #[tokio::test]
    async fn missing_handler_dead_letters_without_reporting_step_failed() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let instance_id = seed_instance(&store).await;
        let registry = HandlerRegistry::new();

        let action = ActionMessage {
            action: "unregistered".into(),
            step_name: "log".into(),
            instance_id,
            config: serde_json::json!({}),
            connection_id: None,
            request_id: None,
        };
        broker
            .publish(NewBrokerMessage {
                destination: ACTIONS_QUEUE.into(),
                payload: serde_json::to_value(&action).unwrap(),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim(ACTIONS_QUEUE, "w1", 1).await.unwrap();
        let message_id = claimed[0].id;

        execute_claimed(store.as_ref(), broker.as_ref(), &registry, claimed[0].clone(), Duration::from_secs(1))
            .await
            .unwrap();

        // No step_complete/step_failed was reported; the message itself was
        // dead-lettered instead of being handed to the orchestrator.
        let due = store.fetch_due_outbox(10).await.unwrap();
        assert!(due.is_empty());
        let dead = broker.dead_letters(ACTIONS_QUEUE).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, message_id);
    }

    #[tokio::test]
    async fn nack_with_backoff_redelivers_within_attempt_budget() {
        let broker = InMemoryBroker::new();
        broker
            .publish(NewBrokerMessage {
                destination: ACTIONS_QUEUE.into(),
                payload: serde_json::json!({}),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim(ACTIONS_QUEUE, "w1", 1).await.unwrap();

        nack_with_backoff(&broker, claimed[0].id, claimed[0].attempt, "transient store error")
            .await
            .unwrap();

        // Still under the 3-attempt budget: redelivered, not dead-lettered.
        assert!(broker.dead_letters(ACTIONS_QUEUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nack_with_backoff_dead_letters_once_attempts_exhausted() {
        let broker = InMemoryBroker::new();
        broker
            .publish(NewBrokerMessage {
                destination: ACTIONS_QUEUE.into(),
                payload: serde_json::json!({}),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim(ACTIONS_QUEUE, "w1", 1).await.unwrap();
        let message_id = claimed[0].id;

        // unexpected_error_retry_policy() allows 3 attempts; this is the 3rd.
        nack_with_backoff(&broker, message_id, 3, "transient store error").await.unwrap();

        let dead = broker.dead_letters(ACTIONS_QUEUE).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, message_id);
    }
}
