//! Run outcome notifications
//!
//! The orchestrator notifies once per terminal run whose status is not
//! `completed`. Delivery failures are logged and never change the run.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::AlertError;
use crate::models::{RunStatus, RunSummary};

/// Default timeout for a webhook delivery in seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> Result<(), AlertError>;
}

/// Writes the summary to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertDispatcher;

#[async_trait]
impl AlertDispatcher for LogAlertDispatcher {
    async fn notify(&self, summary: &RunSummary) -> Result<(), AlertError> {
        if summary.status == RunStatus::Failed {
            error!(
                run_id = %summary.run_id,
                status = %summary.status,
                error = summary.error_message.as_deref().unwrap_or_default(),
                "Reconciliation run failed"
            );
        } else {
            warn!(
                run_id = %summary.run_id,
                status = %summary.status,
                failed = summary.failed,
                errored = summary.errored,
                blocking = summary.blocking_discrepancies,
                failing_checks = ?summary.failing_checks,
                "Reconciliation run did not complete cleanly"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: String,
    summary: &'a RunSummary,
}

/// POSTs the summary as JSON
#[derive(Debug, Clone)]
pub struct WebhookAlertDispatcher {
    client: Client,
    url: String,
}

impl WebhookAlertDispatcher {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl AlertDispatcher for WebhookAlertDispatcher {
    async fn notify(&self, summary: &RunSummary) -> Result<(), AlertError> {
        let payload = WebhookPayload {
            text: format!(
                "Reconciliation run {} finished as {} ({} failed, {} errored)",
                summary.run_id, summary.status, summary.failed, summary.errored
            ),
            summary,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use recon_common::{CheckType, EntityType, ValidationMode};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::models::{ValidationResult, ValidationRun};

    fn partial_failure() -> RunSummary {
        let mut run = ValidationRun::new(vec![EntityType::Event], ValidationMode::Fast, "cron");
        run.start().unwrap();
        run.record(ValidationResult::error(EntityType::Event, CheckType::Count, &"timed out"))
            .unwrap();
        run.finish(false).unwrap();
        run.summary()
    }

    #[tokio::test]
    async fn test_webhook_posts_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/recon"))
            .and(body_partial_json(serde_json::json!({
                "summary": {"status": "partial_failure", "errored": 1}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = WebhookAlertDispatcher::new(format!("{}/hooks/recon", server.uri())).unwrap();
        dispatcher.notify(&partial_failure()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = WebhookAlertDispatcher::new(server.uri()).unwrap();
        let err = dispatcher.notify(&partial_failure()).await.unwrap_err();
        assert!(matches!(err, AlertError::Rejected(500)));
    }

    #[tokio::test]
    async fn test_log_dispatcher_never_fails() {
        assert!(LogAlertDispatcher.notify(&partial_failure()).await.is_ok());
    }
}
