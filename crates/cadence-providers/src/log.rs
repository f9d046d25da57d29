//! Dry-run provider: logs instead of sending. The default when no transport
//! is configured, so a fresh install can exercise the whole pipeline.

use async_trait::async_trait;
use chrono::Utc;

use cadence_core::error::Result;
use cadence_core::lead::Lead;
use cadence_core::traits::{ConnectivityReport, SendProvider};
use cadence_core::types::{MessageContent, SendReceipt};

#[derive(Debug, Default)]
pub struct LogProvider;

impl LogProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SendProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn dispatch_send(&self, lead: &Lead, content: &MessageContent) -> Result<SendReceipt> {
        tracing::info!("✉️ [dry-run] to={} subject={:?}", lead.email, content.subject);
        Ok(SendReceipt {
            provider: "log".into(),
            message_id: Some(format!("dry-{}", uuid::Uuid::new_v4().simple())),
            accepted_at: Utc::now(),
        })
    }

    async fn test_connectivity(&self, _scope: &str) -> Result<Vec<ConnectivityReport>> {
        Ok(vec![ConnectivityReport {
            provider: "log".into(),
            reachable: true,
            latency_ms: 0,
            detail: Some("dry run, nothing is delivered".into()),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_provider_always_accepts() {
        let provider = LogProvider::new();
        let lead = Lead::from_email("a@acme.io").unwrap();
        let content = MessageContent {
            subject: "s".into(),
            body: "b".into(),
        };
        let receipt = provider.dispatch_send(&lead, &content).await.unwrap();
        assert!(receipt.message_id.unwrap().starts_with("dry-"));
        assert!(provider.test_connectivity("any").await.unwrap()[0].reachable);
    }
}
