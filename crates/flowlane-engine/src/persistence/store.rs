//! The `WorkflowStore` port and its transactional unit of work.
//!
//! `WorkflowStore::begin` returns an [`OrchestrationTx`] backed by a single
//! database transaction, so a caller that needs to change instance state,
//! create or update a `StepExecution`, and insert an outbox row together can
//! do so atomically — the orchestrator's single-writer invariant depends on
//! this being one commit, not a sequence of independently-committed calls.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Connection, Instance, OutboxMessage, StepExecution, Version};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A new outbox row to be inserted by a transaction.
///
/// `publish_at` defaults to "now" at the persistence layer when omitted.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub destination: String,
    pub payload: serde_json::Value,
    pub publish_at: Option<chrono::DateTime<chrono::Utc>>,
    pub request_id: Option<String>,
}

impl NewOutboxMessage {
    pub fn new(destination: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            destination: destination.into(),
            payload,
            publish_at: None,
            request_id: None,
        }
    }

    pub fn delayed_until(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.publish_at = Some(at);
        self
    }
}

/// One atomic unit of work against the store.
#[async_trait]
pub trait OrchestrationTx: Send {
    async fn get_instance(&mut self, instance_id: Uuid)
        -> Result<Option<(Instance, Version)>, StoreError>;

    async fn get_latest_step_execution(
        &mut self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError>;

    async fn save_instance(&mut self, instance: &Instance) -> Result<(), StoreError>;

    async fn insert_step_execution(&mut self, step: &StepExecution) -> Result<(), StoreError>;

    async fn update_step_execution(&mut self, step: &StepExecution) -> Result<(), StoreError>;

    async fn insert_outbox(&mut self, message: NewOutboxMessage) -> Result<(), StoreError>;

    async fn get_connection(&mut self, id: &str) -> Result<Option<Connection>, StoreError>;

    /// Commit all writes made through this unit of work.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard all writes made through this unit of work.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Persistence port shared by the orchestrator, worker, and sweeper.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Begin a new atomic unit of work.
    async fn begin(&self) -> Result<Box<dyn OrchestrationTx>, StoreError>;

    /// Read-only instance lookup, for components that do not need a
    /// transaction (e.g. the sweeper's scan, diagnostics).
    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<(Instance, Version)>, StoreError>;

    async fn create_instance(&self, instance: Instance) -> Result<(), StoreError>;

    /// Instances stuck in a non-terminal status since before `updated_before`.
    async fn list_stale_instances(
        &self,
        updated_before: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Instance>, StoreError>;

    async fn get_latest_step_execution(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError>;

    /// Outbox rows due for delivery (`publish_at <= now`, not yet processed),
    /// oldest first, for the outbox relay's poll loop.
    async fn fetch_due_outbox(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Mark outbox rows as delivered so they are not picked up again.
    async fn mark_outbox_processed(&self, ids: &[Uuid]) -> Result<(), StoreError>;
}
