//! HTTP webhook send provider.
//!
//! POSTs one JSON message per send to the configured endpoint (an email relay,
//! an outreach API gateway, ...). The relay answers 2xx with an optional
//! `id` / `message_id` field; anything else is a failure classified by status.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{Value, json};

use cadence_core::error::{CadenceError, Result};
use cadence_core::lead::Lead;
use cadence_core::traits::{ConnectivityReport, SendProvider};
use cadence_core::types::{MessageContent, SendReceipt};

/// Whether a failed response is worth retrying on a later tick.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

pub struct WebhookProvider {
    name: String,
    endpoint: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(name: &str, endpoint: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(CadenceError::ConfigurationMissing(
                "provider endpoint is not configured".into(),
            ));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(CadenceError::Config(format!(
                "provider endpoint must be an http(s) URL: {endpoint}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            endpoint,
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            client: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    fn payload(lead: &Lead, content: &MessageContent) -> Value {
        json!({
            "to": lead.email,
            "name": lead.name,
            "company": lead.company,
            "title": lead.title,
            "subject": content.subject,
            "body": content.body,
        })
    }
}

#[async_trait]
impl SendProvider for WebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch_send(&self, lead: &Lead, content: &MessageContent) -> Result<SendReceipt> {
        let req = self
            .client
            .post(&self.endpoint)
            .json(&Self::payload(lead, content))
            .timeout(self.timeout);

        let resp = self.apply_auth(req).send().await.map_err(|e| {
            // Connect failures and timeouts are transient by nature.
            CadenceError::provider(format!("{}: request failed: {e}", self.name), true)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(CadenceError::provider(
                format!("{}: HTTP {status}: {snippet}", self.name),
                is_retryable_status(status),
            ));
        }

        let message_id = resp.json::<Value>().await.ok().and_then(|v| {
            v.get("message_id")
                .or_else(|| v.get("id"))
                .and_then(|id| id.as_str().map(String::from))
        });
        tracing::debug!("Webhook {} accepted message for {}", self.name, lead.email);
        Ok(SendReceipt {
            provider: self.name.clone(),
            message_id,
            accepted_at: Utc::now(),
        })
    }

    async fn test_connectivity(&self, scope: &str) -> Result<Vec<ConnectivityReport>> {
        let started = Instant::now();
        let req = self
            .client
            .get(&self.endpoint)
            .query(&[("scope", scope)])
            .timeout(self.timeout);
        let report = match self.apply_auth(req).send().await {
            Ok(resp) => {
                let status = resp.status();
                ConnectivityReport {
                    provider: self.name.clone(),
                    reachable: !status.is_server_error(),
                    latency_ms: started.elapsed().as_millis() as u64,
                    detail: Some(format!("HTTP {status}")),
                }
            }
            Err(e) => ConnectivityReport {
                provider: self.name.clone(),
                reachable: false,
                latency_ms: started.elapsed().as_millis() as u64,
                detail: Some(e.to_string()),
            },
        };
        Ok(vec![report])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}/send")
    }

    fn lead() -> Lead {
        Lead::from_email("ann@acme.io").unwrap()
    }

    fn content() -> MessageContent {
        MessageContent {
            subject: "Hi".into(),
            body: "Hello".into(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn test_endpoint_validation() {
        let err = WebhookProvider::new("relay", "  ", "", 5).err().unwrap();
        assert_eq!(err.reason(), "configuration_missing");
        assert!(WebhookProvider::new("relay", "ftp://relay", "", 5).is_err());
        let ok = WebhookProvider::new("relay", "https://relay.example/send/", "", 5).unwrap();
        assert_eq!(ok.endpoint(), "https://relay.example/send");
    }

    #[tokio::test]
    async fn test_dispatch_success_reads_message_id() {
        let router = Router::new().route(
            "/send",
            post(|axum::Json(body): axum::Json<Value>| async move {
                assert_eq!(body["to"], "ann@acme.io");
                axum::Json(json!({ "id": "msg-42" }))
            }),
        );
        let provider = WebhookProvider::new("relay", &serve(router).await, "k", 5).unwrap();
        let receipt = provider.dispatch_send(&lead(), &content()).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("msg-42"));
        assert_eq!(receipt.provider, "relay");
    }

    #[tokio::test]
    async fn test_dispatch_failure_classification() {
        let busy = Router::new().route("/send", post(|| async { AxumStatus::SERVICE_UNAVAILABLE }));
        let provider = WebhookProvider::new("relay", &serve(busy).await, "", 5).unwrap();
        let err = provider.dispatch_send(&lead(), &content()).await.unwrap_err();
        assert!(err.is_retryable());

        let rejected = Router::new().route(
            "/send",
            post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "mailbox does not exist") }),
        );
        let provider = WebhookProvider::new("relay", &serve(rejected).await, "", 5).unwrap();
        let err = provider.dispatch_send(&lead(), &content()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("mailbox does not exist"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        // Nothing listens on port 9 locally.
        let provider = WebhookProvider::new("relay", "http://127.0.0.1:9/send", "", 2).unwrap();
        let err = provider.dispatch_send(&lead(), &content()).await.unwrap_err();
        assert!(err.is_retryable());

        let reports = provider.test_connectivity("brand-1").await.unwrap();
        assert!(!reports[0].reachable);
    }
}
