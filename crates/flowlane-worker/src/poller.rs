//! Polling the actions queue with adaptive backoff.
//!
//! Adapted from the teacher's `TaskPoller`/`AdaptivePoller`: the backoff
//! calculator itself doesn't touch storage, so it carries over unchanged;
//! only the claim call moves from a dedicated task-claim method to
//! [`flowlane_engine::Broker::claim`] against the actions queue.

use std::sync::Arc;
use std::time::Duration;

use flowlane_engine::domain::ACTIONS_QUEUE;
use flowlane_engine::{Broker, BrokerError, ClaimedMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Claims messages from the actions queue, with exponential backoff when
/// idle and an immediate reset to `min_interval` once messages are found.
pub struct ActionPoller<B> {
    broker: Arc<B>,
    consumer_id: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: Broker> ActionPoller<B> {
    pub fn new(broker: Arc<B>, consumer_id: String, config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            broker,
            consumer_id,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    #[instrument(skip(self), fields(consumer_id = %self.consumer_id))]
    pub async fn poll(&mut self, max: usize) -> Result<Vec<ClaimedMessage>, PollerError> {
        if *self.shutdown_rx.borrow() {
            return Ok(vec![]);
        }

        let batch = max.min(self.config.batch_size);
        let claimed = self.broker.claim(ACTIONS_QUEUE, &self.consumer_id, batch).await?;

        if claimed.is_empty() {
            self.increase_backoff();
            trace!(interval_ms = self.current_interval.as_millis(), "no actions found, backing off");
        } else {
            self.reset_backoff();
            debug!(count = claimed.len(), "claimed actions");
        }

        Ok(claimed)
    }

    /// Wait for the current backoff interval, or return early on shutdown.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(self.current_interval.as_secs_f64() * self.config.backoff_multiplier);
        self.current_interval = next.min(self.config.max_interval);
    }
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
