//! The message broker between outbox rows and consumers.
//!
//! Grounded on the teacher's `durable_task_queue` claim pattern
//! (`SELECT ... FOR UPDATE SKIP LOCKED`), generalized from one built-in task
//! table to one claim table shared by both system queues
//! (`orchestration_queue`, `actions_queue`), distinguished by `destination`.

mod memory;
mod postgres;

pub use memory::InMemoryBroker;
pub use postgres::PostgresQueueBroker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker backend error: {0}")]
    Backend(String),

    #[error("message not found: {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone)]
pub struct NewBrokerMessage {
    pub destination: String,
    pub payload: serde_json::Value,
    pub available_at: DateTime<Utc>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub id: Uuid,
    pub destination: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub request_id: Option<String>,
}

/// Message broker abstraction used by the outbox relay (publish) and the
/// orchestrator/worker binaries (claim/ack/nack).
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, message: NewBrokerMessage) -> Result<(), BrokerError>;

    /// Claim up to `max` available messages for `destination`, using
    /// `SELECT ... FOR UPDATE SKIP LOCKED` semantics so that concurrent
    /// consumers never claim the same row twice.
    async fn claim(
        &self,
        destination: &str,
        consumer_id: &str,
        max: usize,
    ) -> Result<Vec<ClaimedMessage>, BrokerError>;

    /// Acknowledge successful processing; the message will not be redelivered.
    async fn ack(&self, message_id: Uuid) -> Result<(), BrokerError>;

    /// Report processing failure. `retry = true` makes the message available
    /// again after `delay` (ignored when `retry` is false); `retry = false`
    /// dead-letters it immediately.
    async fn nack(&self, message_id: Uuid, error: &str, retry: bool, delay: Duration) -> Result<(), BrokerError>;

    /// Dead-lettered messages for a destination, for inspection/requeue tooling.
    async fn dead_letters(&self, destination: &str) -> Result<Vec<ClaimedMessage>, BrokerError>;
}
