//! Environment-sourced configuration shared by every role's subcommand.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub worker_concurrency: usize,
    pub handler_timeout: Duration,
    pub stale_seconds: u64,
    pub sweep_interval: Duration,
}

impl Config {
    /// Load `.env` (if present) then read from the environment, falling back
    /// to sane defaults for everything but `DATABASE_URL`.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            min_connections: env_parse("DB_MIN_CONNECTIONS", 5)?,
            max_connections: env_parse("DB_MAX_CONNECTIONS", 20)?,
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", 1000)?),
            batch_size: env_parse("BATCH_SIZE", 100)?,
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 10)?,
            handler_timeout: Duration::from_millis(env_parse("HANDLER_TIMEOUT_MS", 30_000)?),
            stale_seconds: env_parse("STALE_SECONDS", 60)?,
            sweep_interval: Duration::from_millis(env_parse("SWEEP_INTERVAL_MS", 30_000)?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}
