//! Illustrative action handlers.
//!
//! Real deployments register their own connectors against
//! [`flowlane_contracts::ActionHandler`]; these two ship so the worker is
//! runnable out of the box, mirroring the teacher's bundled handlers.

use std::time::Duration;

use async_trait::async_trait;
use flowlane_contracts::{ActionError, ActionHandler, ActionResult};
use tracing::info;
use uuid::Uuid;

/// Logs the step's config and instance data, then succeeds unconditionally.
/// Useful for smoke-testing a workflow definition end to end.
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn execute(
        &self,
        instance_id: Uuid,
        data: &serde_json::Value,
        config: &serde_json::Value,
    ) -> Result<ActionResult, ActionError> {
        info!(%instance_id, %data, %config, "log action");
        Ok(ActionResult::success(None))
    }
}

/// Issues an HTTP request described by `config`: `url`, `method` (default
/// `GET`), optional `body`. The response body, if JSON, is merged into
/// instance data under `http_response`.
pub struct HttpHandler {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ActionHandler for HttpHandler {
    async fn execute(
        &self,
        _instance_id: Uuid,
        _data: &serde_json::Value,
        config: &serde_json::Value,
    ) -> Result<ActionResult, ActionError> {
        let url = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActionError::Internal("http action requires a \"url\" config field".into()))?;
        let method = config.get("method").and_then(|v| v.as_str()).unwrap_or("GET");

        let mut request = self
            .client
            .request(
                method
                    .parse()
                    .map_err(|e| ActionError::Internal(format!("invalid method {method}: {e}")))?,
                url,
            )
            .timeout(self.timeout);

        if let Some(body) = config.get("body") {
            request = request.json(body);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ActionError::Timeout(self.timeout))?
            .map_err(|e| ActionError::Internal(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            return Ok(ActionResult::failure(format!("http {status}: {body}")));
        }

        Ok(ActionResult::success(Some(serde_json::json!({"http_response": body}))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_handler_always_succeeds() {
        let handler = LogHandler;
        let result = handler
            .execute(Uuid::now_v7(), &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn http_handler_requires_url() {
        let handler = HttpHandler::default();
        let err = handler
            .execute(Uuid::now_v7(), &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Internal(_)));
    }
}
