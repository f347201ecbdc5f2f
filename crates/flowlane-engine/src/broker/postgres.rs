use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{Broker, BrokerError, ClaimedMessage, NewBrokerMessage};

pub struct PostgresQueueBroker {
    pool: PgPool,
}

impl PostgresQueueBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PostgresQueueBroker {
    #[instrument(skip(self, message), fields(destination = %message.destination))]
    async fn publish(&self, message: NewBrokerMessage) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_queue (id, destination, payload, available_at, request_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::now_v7())
        .bind(&message.destination)
        .bind(&message.payload)
        .bind(message.available_at)
        .bind(&message.request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(destination, consumer_id))]
    async fn claim(
        &self,
        destination: &str,
        consumer_id: &str,
        max: usize,
    ) -> Result<Vec<ClaimedMessage>, BrokerError> {
        let rows = sqlx::query(
            "WITH claimable AS ( \
                 SELECT id FROM broker_queue \
                 WHERE destination = $1 AND status = 'pending' AND available_at <= now() \
                 ORDER BY available_at \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE broker_queue t SET status = 'claimed', claimed_by = $3, claimed_at = now(), \
                 attempt = attempt + 1 \
             FROM claimable c WHERE t.id = c.id \
             RETURNING t.id, t.destination, t.payload, t.attempt, t.request_id",
        )
        .bind(destination)
        .bind(max as i64)
        .bind(consumer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BrokerError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| ClaimedMessage {
                id: row.get("id"),
                destination: row.get("destination"),
                payload: row.get("payload"),
                attempt: row.get("attempt"),
                request_id: row.get("request_id"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn ack(&self, message_id: Uuid) -> Result<(), BrokerError> {
        let result = sqlx::query("UPDATE broker_queue SET status = 'done' WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(message_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn nack(&self, message_id: Uuid, error: &str, retry: bool, delay: Duration) -> Result<(), BrokerError> {
        let status = if retry { "pending" } else { "dead" };
        let available_at = chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let result = sqlx::query(
            "UPDATE broker_queue SET status = $2, last_error = $3, claimed_by = NULL, \
             claimed_at = NULL, available_at = $4 WHERE id = $1",
        )
        .bind(message_id)
        .bind(status)
        .bind(error)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(message_id));
        }
        Ok(())
    }

    async fn dead_letters(&self, destination: &str) -> Result<Vec<ClaimedMessage>, BrokerError> {
        let rows = sqlx::query(
            "SELECT id, destination, payload, attempt, request_id FROM broker_queue \
             WHERE destination = $1 AND status = 'dead' ORDER BY created_at",
        )
        .bind(destination)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BrokerError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| ClaimedMessage {
                id: row.get("id"),
                destination: row.get("destination"),
                payload: row.get("payload"),
                attempt: row.get("attempt"),
                request_id: row.get("request_id"),
            })
            .collect())
    }
}
