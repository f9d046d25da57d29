//! Where a tick invocation goes: the gateway over HTTP, or the scheduler in
//! this process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use cadence_core::error::ErrorKind;
use cadence_scheduler::TickScheduler;

/// Statuses answered by a busy or briefly unavailable scheduler.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Why one attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The entry point answered with a non-success status.
    Status { code: u16, body: String },
    /// No answer: connect error, timeout, broken body.
    Transport(String),
}

impl AttemptFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { code, .. } => RETRYABLE_STATUSES.contains(code),
            Self::Transport(_) => true,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { code, body } if body.is_empty() => write!(f, "HTTP {code}"),
            Self::Status { code, body } => write!(f, "HTTP {code}: {body}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// The tick entry point as seen by the trigger.
#[async_trait]
pub trait TickTarget: Send + Sync {
    fn describe(&self) -> String;

    /// One attempt. Returns the tick report as JSON.
    async fn call(&self, max_runs: u32) -> Result<Value, AttemptFailure>;
}

/// POSTs to `{endpoint}/api/v1/scheduler/tick`.
pub struct HttpTickTarget {
    url: String,
    secret: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpTickTarget {
    pub fn new(endpoint: &str, secret: Option<String>, timeout_secs: u64) -> Self {
        Self {
            url: format!("{}/api/v1/scheduler/tick", endpoint.trim().trim_end_matches('/')),
            secret: secret.filter(|s| !s.is_empty()),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TickTarget for HttpTickTarget {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn call(&self, max_runs: u32) -> Result<Value, AttemptFailure> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&json!({ "max_runs": max_runs }))
            .timeout(self.timeout);
        if let Some(secret) = &self.secret {
            req = req.header("Authorization", format!("Bearer {secret}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AttemptFailure::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AttemptFailure::Status {
                code: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| AttemptFailure::Transport(format!("invalid tick response: {e}")))
    }
}

/// Calls the scheduler directly, mapping its errors onto HTTP-like statuses
/// so retry classification is the same as over the wire.
pub struct LocalTickTarget {
    scheduler: Arc<TickScheduler>,
}

impl LocalTickTarget {
    pub fn new(scheduler: Arc<TickScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl TickTarget for LocalTickTarget {
    fn describe(&self) -> String {
        "in-process scheduler".into()
    }

    async fn call(&self, max_runs: u32) -> Result<Value, AttemptFailure> {
        match self.scheduler.tick(max_runs).await {
            Ok(report) => serde_json::to_value(report)
                .map_err(|e| AttemptFailure::Transport(e.to_string())),
            Err(e) => {
                let code = match e.kind() {
                    ErrorKind::Validation => 400,
                    ErrorKind::NotFound => 404,
                    ErrorKind::Unauthorized => 401,
                    ErrorKind::IllegalTransition => 409,
                    _ => 500,
                };
                Err(AttemptFailure::Status {
                    code,
                    body: e.to_string(),
                })
            }
        }
    }
}
