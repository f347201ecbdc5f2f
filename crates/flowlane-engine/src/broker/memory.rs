use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Broker, BrokerError, ClaimedMessage, NewBrokerMessage};

#[derive(Clone)]
struct Row {
    message: ClaimedMessage,
    available_at: chrono::DateTime<Utc>,
    status: Status,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Claimed,
    Done,
    Dead,
}

/// In-memory broker for unit tests: same claim semantics as the Postgres
/// implementation (one claim per message, no double-delivery to concurrent
/// claimants) without a database.
#[derive(Default)]
pub struct InMemoryBroker {
    rows: Mutex<HashMap<Uuid, Row>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: NewBrokerMessage) -> Result<(), BrokerError> {
        let id = Uuid::now_v7();
        self.rows.lock().insert(
            id,
            Row {
                message: ClaimedMessage {
                    id,
                    destination: message.destination,
                    payload: message.payload,
                    attempt: 0,
                    request_id: message.request_id,
                },
                available_at: message.available_at,
                status: Status::Pending,
            },
        );
        Ok(())
    }

    async fn claim(
        &self,
        destination: &str,
        _consumer_id: &str,
        max: usize,
    ) -> Result<Vec<ClaimedMessage>, BrokerError> {
        let now = Utc::now();
        let mut rows = self.rows.lock();
        let mut claimed = Vec::new();
        let mut ids: Vec<Uuid> = rows
            .iter()
            .filter(|(_, r)| {
                r.status == Status::Pending && r.message.destination == destination && r.available_at <= now
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        for id in ids.into_iter().take(max) {
            let row = rows.get_mut(&id).unwrap();
            row.status = Status::Claimed;
            row.message.attempt += 1;
            claimed.push(row.message.clone());
        }
        Ok(claimed)
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), BrokerError> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&message_id).ok_or(BrokerError::NotFound(message_id))?;
        row.status = Status::Done;
        Ok(())
    }

    async fn nack(&self, message_id: Uuid, _error: &str, retry: bool, delay: Duration) -> Result<(), BrokerError> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&message_id).ok_or(BrokerError::NotFound(message_id))?;
        row.status = if retry { Status::Pending } else { Status::Dead };
        row.available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Ok(())
    }

    async fn dead_letters(&self, destination: &str) -> Result<Vec<ClaimedMessage>, BrokerError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| r.status == Status::Dead && r.message.destination == destination)
            .map(|r| r.message.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claim_is_exclusive() {
        let broker = InMemoryBroker::new();
        broker
            .publish(NewBrokerMessage {
                destination: "actions_queue".into(),
                payload: json!({}),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();

        let first = broker.claim("actions_queue", "w1", 10).await.unwrap();
        let second = broker.claim("actions_queue", "w2", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[tokio::test]
    async fn nack_retry_makes_available_again() {
        let broker = InMemoryBroker::new();
        broker
            .publish(NewBrokerMessage {
                destination: "actions_queue".into(),
                payload: json!({}),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim("actions_queue", "w1", 10).await.unwrap();
        broker.nack(claimed[0].id, "boom", true, Duration::ZERO).await.unwrap();
        let reclaimed = broker.claim("actions_queue", "w2", 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 2);
    }

    #[tokio::test]
    async fn nack_no_retry_dead_letters() {
        let broker = InMemoryBroker::new();
        broker
            .publish(NewBrokerMessage {
                destination: "actions_queue".into(),
                payload: json!({}),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim("actions_queue", "w1", 10).await.unwrap();
        broker.nack(claimed[0].id, "fatal", false, Duration::ZERO).await.unwrap();
        let dead = broker.dead_letters("actions_queue").await.unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn nack_retry_with_delay_is_not_immediately_claimable() {
        let broker = InMemoryBroker::new();
        broker
            .publish(NewBrokerMessage {
                destination: "actions_queue".into(),
                payload: json!({}),
                available_at: Utc::now(),
                request_id: None,
            })
            .await
            .unwrap();
        let claimed = broker.claim("actions_queue", "w1", 10).await.unwrap();
        broker
            .nack(claimed[0].id, "lock contention", true, Duration::from_secs(60))
            .await
            .unwrap();
        let reclaimed = broker.claim("actions_queue", "w2", 10).await.unwrap();
        assert!(reclaimed.is_empty());
    }
}
