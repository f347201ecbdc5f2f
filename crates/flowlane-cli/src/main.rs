//! Flowlane role runner: one process, one subcommand, one role.
//!
//! `flowlane orchestrator|relay|worker|sweeper` each load `Config::from_env`,
//! initialize tracing, open one `sqlx::PgPool`, and run that role's loop
//! until `ctrl_c`.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use flowlane_contracts::WorkflowEvent;
use flowlane_engine::domain::ORCHESTRATION_QUEUE;
use flowlane_engine::{
    Broker, InstanceLock, Orchestrator, PostgresAdvisoryLock, PostgresQueueBroker, PostgresWorkflowStore, RetryPolicy,
};
use flowlane_sweeper::{SweeperConfig, SweeperService};
use flowlane_worker::{handlers, ActionWorker, HandlerRegistry, PollerConfig, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowlane")]
#[command(about = "Durable, event-driven workflow execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Drive instance state machines forward in response to queued events.
    Orchestrator,
    /// Relay committed outbox rows to the broker.
    Relay,
    /// Claim and execute queued actions.
    Worker,
    /// Periodically re-activate instances whose intent was lost.
    Sweeper,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    match cli.role {
        Role::Orchestrator => run_orchestrator(pool, config).await,
        Role::Relay => run_relay(pool, config).await,
        Role::Worker => run_worker(pool, config).await,
        Role::Sweeper => run_sweeper(pool, config).await,
    }
}

/// Claim events off `orchestration_queue` and feed them to the orchestrator,
/// one at a time per claim batch, acking/nacking per the event outcome.
async fn run_orchestrator(pool: sqlx::PgPool, config: Config) -> Result<()> {
    let store = Arc::new(PostgresWorkflowStore::new(pool.clone()));
    let lock = Arc::new(PostgresAdvisoryLock::new(pool.clone()));
    let broker = Arc::new(PostgresQueueBroker::new(pool));
    let orchestrator = Orchestrator::new(store, lock);
    let consumer_id = format!("orchestrator-{}", uuid::Uuid::now_v7());

    tracing::info!(%consumer_id, "starting orchestrator");

    tokio::select! {
        _ = orchestrator_loop(&orchestrator, broker.as_ref(), &consumer_id, &config) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }
    Ok(())
}

/// Lock contention is expected to clear quickly once the other consumer
/// finishes, so it gets a patient, closely-spaced retry: 5 s apart, 12 attempts.
fn lock_contention_retry_policy() -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_secs(5), 12)
}

/// Unexpected orchestrator errors (store/lock backend faults) get a shorter,
/// backed-off retry before giving up: 10 s initial interval, 3 attempts.
fn unexpected_error_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential()
        .with_initial_interval(Duration::from_secs(10))
        .with_max_attempts(3)
}

/// Redeliver `message` with the backoff `policy` prescribes for its current
/// attempt count, or dead-letter it once the policy's attempts are exhausted.
async fn nack_with_policy<B: Broker>(broker: &B, message_id: uuid::Uuid, attempt: i32, error: &str, policy: &RetryPolicy) {
    let attempt = attempt.max(0) as u32;
    if policy.has_attempts_remaining(attempt) {
        let delay = policy.delay_for_attempt(attempt + 1);
        tracing::warn!(error = %error, attempt, ?delay, "retryable orchestrator error, redelivering with backoff");
        let _ = broker.nack(message_id, error, true, delay).await;
    } else {
        tracing::error!(error = %error, attempt, "retry attempts exhausted, dead-lettering");
        let _ = broker.nack(message_id, error, false, Duration::ZERO).await;
    }
}

async fn orchestrator_loop<S, L, B>(
    orchestrator: &Orchestrator<S, L>,
    broker: &B,
    consumer_id: &str,
    config: &Config,
) where
    S: flowlane_engine::WorkflowStore,
    L: InstanceLock,
    B: Broker,
{
    loop {
        let claimed = match broker.claim(ORCHESTRATION_QUEUE, consumer_id, config.batch_size as usize).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(error = %e, "failed to claim orchestration events");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        if claimed.is_empty() {
            tokio::time::sleep(config.poll_interval).await;
            continue;
        }

        for message in claimed {
            let event: WorkflowEvent = match serde_json::from_value(message.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(message_id = %message.id, error = %e, "malformed workflow event, dead-lettering");
                    let _ = broker.nack(message.id, &e.to_string(), false, Duration::ZERO).await;
                    continue;
                }
            };

            match orchestrator.process_event(&event).await {
                Ok(outcome) => {
                    tracing::debug!(?outcome, instance_id = %event.instance_id(), "processed event");
                    let _ = broker.ack(message.id).await;
                }
                Err(flowlane_engine::OrchestratorError::LockContention(msg)) => {
                    nack_with_policy(broker, message.id, message.attempt, &msg, &lock_contention_retry_policy()).await;
                }
                Err(flowlane_engine::OrchestratorError::Retryable(msg)) => {
                    nack_with_policy(broker, message.id, message.attempt, &msg, &unexpected_error_retry_policy()).await;
                }
                Err(flowlane_engine::OrchestratorError::NonRetryable(msg)) => {
                    tracing::error!(error = %msg, "non-retryable orchestrator error, dead-lettering");
                    let _ = broker.nack(message.id, &msg, false, Duration::ZERO).await;
                }
            }
        }
    }
}

async fn run_relay(pool: sqlx::PgPool, config: Config) -> Result<()> {
    let store = Arc::new(PostgresWorkflowStore::new(pool.clone()));
    let broker = Arc::new(PostgresQueueBroker::new(pool));
    let relay = flowlane_relay::RelayService::new(
        store,
        broker,
        flowlane_relay::RelayConfig {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
        },
    );

    tracing::info!("starting outbox relay");
    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }
    Ok(())
}

/// Registers the two illustrative handlers (`log`, `http`) shipped with this
/// crate. Deployments with real connectors register additional handlers the
/// same way before calling `run`.
fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("log", Arc::new(handlers::LogHandler));
    registry.register("http", Arc::new(handlers::HttpHandler::default()));
    registry
}

async fn run_worker(pool: sqlx::PgPool, config: Config) -> Result<()> {
    let store = Arc::new(PostgresWorkflowStore::new(pool.clone()));
    let broker = Arc::new(PostgresQueueBroker::new(pool));
    let worker_config = WorkerConfig {
        max_concurrency: config.worker_concurrency,
        handler_timeout: config.handler_timeout,
        poller: PollerConfig {
            batch_size: config.batch_size.max(1) as usize,
            ..PollerConfig::default()
        },
        ..WorkerConfig::default()
    };
    let worker = ActionWorker::new(store, broker, default_registry(), worker_config);
    let consumer_id = format!("worker-{}", uuid::Uuid::now_v7());

    tracing::info!(%consumer_id, "starting action worker");
    tokio::select! {
        result = worker.run(consumer_id) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker loop exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            worker.shutdown();
        }
    }
    Ok(())
}

async fn run_sweeper(pool: sqlx::PgPool, config: Config) -> Result<()> {
    let store = Arc::new(PostgresWorkflowStore::new(pool));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sweeper = SweeperService::new(
        store,
        SweeperConfig {
            poll_interval: config.sweep_interval,
            stale_after: Duration::from_secs(config.stale_seconds),
        },
        shutdown_rx,
    );

    tracing::info!("starting recovery sweeper");
    tokio::select! {
        _ = sweeper.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    }
    Ok(())
}
