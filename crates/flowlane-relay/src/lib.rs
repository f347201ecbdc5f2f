//! The outbox relay: polls committed outbox rows and republishes them onto
//! broker queues, so a transaction the orchestrator already committed is
//! guaranteed to eventually produce a delivery attempt even if the broker
//! was unreachable at commit time.
//!
//! Grounded on the original relay's `keep_listening`/`relay_messages` loop:
//! fetch a batch, publish each message, stop the batch (not the process) on
//! the first publish failure so later messages in the batch don't skip
//! ahead of one still pending retry, and mark only what succeeded.

use std::sync::Arc;
use std::time::Duration;

use flowlane_engine::domain::{ACTIONS_QUEUE, ORCHESTRATION_QUEUE};
use flowlane_engine::{Broker, NewBrokerMessage, StoreError, WorkflowStore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A destination this relay knows how to route. Unknown destinations are
/// logged and left un-republished rather than crashing the loop — the same
/// behavior the original router used for an unmapped destination.
fn is_known_destination(destination: &str) -> bool {
    matches!(destination, ORCHESTRATION_QUEUE | ACTIONS_QUEUE)
}

pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

pub struct RelayService<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    config: RelayConfig,
}

impl<S, B> RelayService<S, B>
where
    S: WorkflowStore,
    B: Broker,
{
    pub fn new(store: Arc<S>, broker: Arc<B>, config: RelayConfig) -> Self {
        Self { store, broker, config }
    }

    /// Poll forever, sleeping `poll_interval` whenever a pass relays nothing.
    pub async fn run(&self) {
        info!("outbox relay starting");
        loop {
            match self.relay_once().await {
                Ok(0) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "relay pass failed, backing off");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// One poll-publish-mark pass. Returns the number of messages relayed.
    #[instrument(skip(self))]
    pub async fn relay_once(&self) -> Result<usize, RelayError> {
        let due = self.store.fetch_due_outbox(self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut processed: Vec<Uuid> = Vec::new();
        for message in due {
            if !is_known_destination(&message.destination) {
                warn!(destination = %message.destination, id = %message.id, "no route for destination, skipping");
                continue;
            }

            let publish = NewBrokerMessage {
                destination: message.destination.clone(),
                payload: message.payload.clone(),
                available_at: message.publish_at,
                request_id: message.request_id.clone(),
            };

            match self.broker.publish(publish).await {
                Ok(()) => processed.push(message.id),
                Err(err) => {
                    warn!(id = %message.id, error = %err, "failed to publish outbox message, will retry later");
                    break;
                }
            }
        }

        if !processed.is_empty() {
            self.store.mark_outbox_processed(&processed).await?;
            info!(count = processed.len(), "relayed outbox messages");
        }

        Ok(processed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlane_engine::persistence::InMemoryWorkflowStore;
    use flowlane_engine::{InMemoryBroker, NewOutboxMessage, OrchestrationTx};

    async fn push_outbox(store: &InMemoryWorkflowStore, destination: &str) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_outbox(NewOutboxMessage::new(destination, serde_json::json!({})))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn relays_due_message_and_marks_processed() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        push_outbox(&store, ACTIONS_QUEUE).await;

        let relay = RelayService::new(store.clone(), broker.clone(), RelayConfig::default());
        let count = relay.relay_once().await.unwrap();
        assert_eq!(count, 1);

        let claimed = broker.claim(ACTIONS_QUEUE, "w1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Second pass finds nothing left to relay.
        assert_eq!(relay.relay_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_destination_is_skipped_not_fatal() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        push_outbox(&store, "mystery_queue").await;
        push_outbox(&store, ORCHESTRATION_QUEUE).await;

        let relay = RelayService::new(store, broker.clone(), RelayConfig::default());
        let count = relay.relay_once().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(broker.claim(ORCHESTRATION_QUEUE, "w1", 10).await.unwrap().len(), 1);
    }
}
