//! sqlx/PostgreSQL-backed [`WorkflowStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    Connection, Instance, InstanceStatus, StepExecution, StepStatus, Version,
};

use super::store::{NewOutboxMessage, OrchestrationTx, StoreError, WorkflowStore};

pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Pending => "pending",
        InstanceStatus::Running => "running",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> Result<InstanceStatus, StoreError> {
    Ok(match s {
        "pending" => InstanceStatus::Pending,
        "running" => InstanceStatus::Running,
        "completed" => InstanceStatus::Completed,
        "failed" => InstanceStatus::Failed,
        "cancelled" => InstanceStatus::Cancelled,
        other => return Err(StoreError::Database(format!("unknown instance status: {other}"))),
    })
}

fn step_status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
    }
}

fn parse_step_status(s: &str) -> Result<StepStatus, StoreError> {
    Ok(match s {
        "pending" => StepStatus::Pending,
        "running" => StepStatus::Running,
        "completed" => StepStatus::Completed,
        "failed" => StepStatus::Failed,
        other => return Err(StoreError::Database(format!("unknown step status: {other}"))),
    })
}

async fn fetch_instance<'e, E>(executor: E, instance_id: Uuid) -> Result<Option<Instance>, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(
        "SELECT id, version_id, status, current_step, current_step_attempts, data, created_at, updated_at \
         FROM workflow_instances WHERE id = $1",
    )
    .bind(instance_id)
    .fetch_optional(executor)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(Instance {
        id: row.get("id"),
        version_id: row.get("version_id"),
        status: parse_status(row.get::<&str, _>("status"))?,
        current_step: row.get("current_step"),
        current_step_attempts: row.get("current_step_attempts"),
        data: row.get("data"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

async fn fetch_version<'e, E>(executor: E, version_id: Uuid) -> Result<Option<Version>, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query("SELECT id, workflow_id, definition, created_at FROM workflow_versions WHERE id = $1")
        .bind(version_id)
        .fetch_optional(executor)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

    let Some(row) = row else { return Ok(None) };
    let definition_json: serde_json::Value = row.get("definition");
    let definition = serde_json::from_value(definition_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Some(Version {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        definition,
        created_at: row.get("created_at"),
    }))
}

async fn fetch_latest_step_execution<'e, E>(
    executor: E,
    instance_id: Uuid,
    step_name: &str,
) -> Result<Option<StepExecution>, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(
        "SELECT id, instance_id, step_name, status, attempt, input, output, error, started_at, completed_at \
         FROM workflow_step_executions WHERE instance_id = $1 AND step_name = $2 \
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(instance_id)
    .bind(step_name)
    .fetch_optional(executor)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(StepExecution {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        step_name: row.get("step_name"),
        status: parse_step_status(row.get::<&str, _>("status"))?,
        attempt: row.get("attempt"),
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    }))
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self))]
    async fn begin(&self) -> Result<Box<dyn OrchestrationTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Box::new(PostgresTx { tx: Some(tx) }))
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<(Instance, Version)>, StoreError> {
        let Some(instance) = fetch_instance(&self.pool, instance_id).await? else {
            return Ok(None);
        };
        let version = fetch_version(&self.pool, instance.version_id)
            .await?
            .ok_or(StoreError::VersionNotFound(instance.version_id))?;
        Ok(Some((instance, version)))
    }

    #[instrument(skip(self))]
    async fn create_instance(&self, instance: Instance) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflow_instances \
             (id, version_id, status, current_step, current_step_attempts, data, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(instance.id)
        .bind(instance.version_id)
        .bind(status_str(instance.status))
        .bind(&instance.current_step)
        .bind(instance.current_step_attempts)
        .bind(&instance.data)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_stale_instances(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, version_id, status, current_step, current_step_attempts, data, created_at, updated_at \
             FROM workflow_instances \
             WHERE status IN ('pending', 'running') AND updated_at < $1",
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(Instance {
                    id: row.get("id"),
                    version_id: row.get("version_id"),
                    status: parse_status(row.get::<&str, _>("status"))?,
                    current_step: row.get("current_step"),
                    current_step_attempts: row.get("current_step_attempts"),
                    data: row.get("data"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_latest_step_execution(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        fetch_latest_step_execution(&self.pool, instance_id, step_name).await
    }

    #[instrument(skip(self))]
    async fn fetch_due_outbox(&self, limit: i64) -> Result<Vec<crate::domain::OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, destination, payload, publish_at, processed_at, created_at, request_id \
             FROM outbox WHERE processed_at IS NULL AND publish_at <= now() \
             ORDER BY publish_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| crate::domain::OutboxMessage {
                id: row.get("id"),
                destination: row.get("destination"),
                payload: row.get("payload"),
                publish_at: row.get("publish_at"),
                processed_at: row.get("processed_at"),
                created_at: row.get("created_at"),
                request_id: row.get("request_id"),
            })
            .collect())
    }

    #[instrument(skip(self, ids))]
    async fn mark_outbox_processed(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox SET processed_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

/// One `sqlx::Transaction` wrapped to satisfy the object-safe
/// [`OrchestrationTx`] trait. `tx` is an `Option` purely so `commit`/
/// `rollback` can move the owned transaction out of `&mut self` by-value
/// methods on a type behind `Box<dyn Trait>`.
struct PostgresTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTx {
    fn conn(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("transaction used after commit/rollback")
    }
}

#[async_trait]
impl OrchestrationTx for PostgresTx {
    async fn get_instance(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Option<(Instance, Version)>, StoreError> {
        let Some(instance) = fetch_instance(&mut *self.conn(), instance_id).await? else {
            return Ok(None);
        };
        let version = fetch_version(&mut *self.conn(), instance.version_id)
            .await?
            .ok_or(StoreError::VersionNotFound(instance.version_id))?;
        Ok(Some((instance, version)))
    }

    async fn get_latest_step_execution(
        &mut self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        fetch_latest_step_execution(&mut *self.conn(), instance_id, step_name).await
    }

    async fn save_instance(&mut self, instance: &Instance) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_instances SET status = $2, current_step = $3, \
             current_step_attempts = $4, data = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(instance.id)
        .bind(status_str(instance.status))
        .bind(&instance.current_step)
        .bind(instance.current_step_attempts)
        .bind(&instance.data)
        .bind(instance.updated_at)
        .execute(&mut *self.conn())
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn insert_step_execution(&mut self, step: &StepExecution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflow_step_executions \
             (id, instance_id, step_name, status, attempt, input, output, error, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(step.id)
        .bind(step.instance_id)
        .bind(&step.step_name)
        .bind(step_status_str(step.status))
        .bind(step.attempt)
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&mut *self.conn())
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_step_execution(&mut self, step: &StepExecution) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_step_executions SET status = $2, output = $3, error = $4, completed_at = $5 \
             WHERE id = $1",
        )
        .bind(step.id)
        .bind(step_status_str(step.status))
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.completed_at)
        .execute(&mut *self.conn())
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn insert_outbox(&mut self, message: NewOutboxMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO outbox (id, destination, payload, publish_at, request_id) \
             VALUES ($1, $2, $3, COALESCE($4, now()), $5)",
        )
        .bind(Uuid::now_v7())
        .bind(&message.destination)
        .bind(&message.payload)
        .bind(message.publish_at)
        .bind(&message.request_id)
        .execute(&mut *self.conn())
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_connection(&mut self, id: &str) -> Result<Option<Connection>, StoreError> {
        let uuid = Uuid::parse_str(id)
            .map_err(|e| StoreError::Database(format!("invalid connection id: {e}")))?;
        let row = sqlx::query("SELECT id, connector_id, name, config FROM connections WHERE id = $1")
            .bind(uuid)
            .fetch_optional(&mut *self.conn())
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Connection {
            id: row.get("id"),
            connector_id: row.get("connector_id"),
            name: row.get("name"),
            config: row.get("config"),
        }))
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .take()
            .expect("transaction used after commit/rollback")
            .commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .take()
            .expect("transaction used after commit/rollback")
            .rollback()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
