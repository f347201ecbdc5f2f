//! # Flowlane Sweeper
//!
//! The recovery sweeper: a periodic scan that re-activates instances whose
//! in-flight intent was lost — a crash between an orchestrator write and the
//! relay delivering it, a lost broker message, or a worker crash before it
//! could report a result.
//!
//! Structurally the sibling of the teacher's stale-task reclaim loop: a
//! `tokio::time::interval` driving a scan, with the same `watch::channel`
//! graceful-shutdown signal used throughout this codebase's worker loops.
//! What differs is the unit being reclaimed (a whole instance, not a single
//! claimed task) and the decision tree for what to re-emit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowlane_contracts::StepSpec;
use flowlane_engine::domain::{InstanceStatus, StepStatus, ACTIONS_QUEUE, ORCHESTRATION_QUEUE};
use flowlane_engine::{NewOutboxMessage, StoreError, WorkflowStore};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub poll_interval: Duration,
    /// An instance is stale once its `updated_at` is older than this.
    pub stale_after: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweeperError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct SweeperService<S> {
    store: Arc<S>,
    config: SweeperConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: WorkflowStore> SweeperService<S> {
    pub fn new(store: Arc<S>, config: SweeperConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            store,
            config,
            shutdown_rx,
        }
    }

    /// Run the scan/tick loop until shutdown.
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(count) if count > 0 => info!(count, "re-activated stale instances"),
                        Ok(_) => debug!("sweep found no stale instances"),
                        Err(e) => warn!(error = %e, "sweep pass failed"),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One scan: find stale instances and re-emit their lost intent.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize, SweeperError> {
        let cutoff = Utc::now() - self.config.stale_after;
        let stale = self.store.list_stale_instances(cutoff).await?;

        let mut reactivated = 0;
        for instance in stale {
            if self.reactivate(instance.id, instance.status, instance.current_step.as_deref()).await? {
                reactivated += 1;
            }
        }
        Ok(reactivated)
    }

    async fn reactivate(&self, instance_id: Uuid, status: InstanceStatus, current_step: Option<&str>) -> Result<bool, SweeperError> {
        match status {
            InstanceStatus::Pending => {
                self.emit_orchestration(serde_json::json!({
                    "type": "start_workflow",
                    "instance_id": instance_id,
                }))
                .await?;
                debug!(%instance_id, "re-emitted start_workflow");
                Ok(true)
            }

            InstanceStatus::Running => {
                let Some(step_name) = current_step else {
                    warn!(%instance_id, "running instance has no current_step, skipping");
                    return Ok(false);
                };

                if let Some(execution) = self.store.get_latest_step_execution(instance_id, step_name).await? {
                    if execution.status == StepStatus::Completed {
                        self.emit_orchestration(serde_json::json!({
                            "type": "step_complete",
                            "instance_id": instance_id,
                            "step_name": step_name,
                            "data": execution.output,
                        }))
                        .await?;
                        debug!(%instance_id, step = %step_name, "re-emitted step_complete from stored output");
                        return Ok(true);
                    }
                }

                self.redispatch_action(instance_id, step_name).await
            }

            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled => Ok(false),
        }
    }

    async fn redispatch_action(&self, instance_id: Uuid, step_name: &str) -> Result<bool, SweeperError> {
        let Some((_instance, version)) = self.store.get_instance(instance_id).await? else {
            warn!(%instance_id, "instance vanished between scan and re-dispatch");
            return Ok(false);
        };

        let Some(StepSpec::Action {
            action_id,
            config,
            connection_id,
            ..
        }) = version.definition.step(step_name)
        else {
            warn!(%instance_id, step = %step_name, "current step is not an action step, skipping re-dispatch");
            return Ok(false);
        };

        let mut tx = self.store.begin().await?;
        tx.insert_outbox(NewOutboxMessage::new(
            ACTIONS_QUEUE,
            serde_json::json!({
                "action": action_id,
                "step_name": step_name,
                "instance_id": instance_id,
                "config": config,
                "connection_id": connection_id,
            }),
        ))
        .await?;
        tx.commit().await?;

        debug!(%instance_id, step = %step_name, "re-dispatched action");
        Ok(true)
    }

    async fn emit_orchestration(&self, payload: serde_json::Value) -> Result<(), SweeperError> {
        let mut tx = self.store.begin().await?;
        tx.insert_outbox(NewOutboxMessage::new(ORCHESTRATION_QUEUE, payload)).await?;
        tx.commit().await?;
        Ok(())
    }
}
