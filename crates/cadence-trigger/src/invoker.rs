//! Bounded-retry invocation of the tick entry point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use cadence_core::config::TriggerConfig;

use crate::target::{AttemptFailure, TickTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TriggerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_step: Duration::from_millis(config.backoff_step_ms),
        }
    }

    /// Linear: wait `attempt × step` after the given (1-based) attempt fails.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationSource {
    Periodic,
    Manual,
    Nudge,
}

/// Outcome of one invocation, including every retry it made.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub ok: bool,
    pub source: InvocationSource,
    pub attempt_count: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Value>,
}

impl InvocationResult {
    fn rejected(source: InvocationSource, reason: &str, error: &str, started: Instant) -> Self {
        Self {
            ok: false,
            source,
            attempt_count: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
            status: None,
            reason: Some(reason.to_string()),
            error: Some(error.to_string()),
            report: None,
        }
    }
}

pub struct TickInvoker {
    target: Option<Arc<dyn TickTarget>>,
    policy: RetryPolicy,
    secret: Option<String>,
    max_runs: u32,
}

impl TickInvoker {
    pub fn new(target: Option<Arc<dyn TickTarget>>, max_runs: u32) -> Self {
        Self {
            target,
            policy: RetryPolicy::default(),
            secret: None,
            max_runs: max_runs.max(1),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Secret the manual trigger's bearer token must match.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// Operator entry: checks `Authorization: Bearer <secret>` before the
    /// scheduler is touched.
    pub async fn invoke_manual(&self, authorization: Option<&str>) -> InvocationResult {
        let started = Instant::now();
        let Some(secret) = &self.secret else {
            return InvocationResult::rejected(
                InvocationSource::Manual,
                "configuration_missing",
                "no trigger secret configured",
                started,
            );
        };
        if !bearer_matches(authorization, secret) {
            tracing::warn!("⚠️ Manual trigger rejected: missing or invalid bearer token");
            return InvocationResult::rejected(
                InvocationSource::Manual,
                "unauthorized",
                "missing or invalid bearer token",
                started,
            );
        }
        self.invoke(InvocationSource::Manual).await
    }

    /// Call the target until it succeeds, fails terminally, or attempts run out.
    /// Never panics or returns an error; the outcome is in the result.
    pub async fn invoke(&self, source: InvocationSource) -> InvocationResult {
        let started = Instant::now();
        let Some(target) = &self.target else {
            tracing::warn!("⚠️ Tick invocation skipped: no scheduler endpoint configured");
            return InvocationResult::rejected(
                source,
                "configuration_missing",
                "no scheduler endpoint configured",
                started,
            );
        };

        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            match target.call(self.max_runs).await {
                Ok(report) => {
                    tracing::debug!(
                        "Tick via {} ok after {attempt} attempt(s) ({:?})",
                        target.describe(),
                        source
                    );
                    return InvocationResult {
                        ok: true,
                        source,
                        attempt_count: attempt,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        status: Some(200),
                        reason: None,
                        error: None,
                        report: Some(report),
                    };
                }
                Err(failure) => {
                    if !failure.is_retryable() || attempt >= self.policy.max_attempts {
                        break failure;
                    }
                    let wait = self.policy.backoff(attempt);
                    tracing::warn!(
                        "🔄 Tick attempt {attempt}/{} via {} failed: {failure}; retrying in {}ms",
                        self.policy.max_attempts,
                        target.describe(),
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        };

        let reason = match &failure {
            AttemptFailure::Status { code: 401 | 403, .. } => "unauthorized",
            f if f.is_retryable() => "attempts_exhausted",
            _ => "tick_rejected",
        };
        tracing::warn!(
            "⚠️ Tick invocation ({:?}) failed after {attempt} attempt(s): {failure}",
            source
        );
        InvocationResult {
            ok: false,
            source,
            attempt_count: attempt,
            elapsed_ms: started.elapsed().as_millis() as u64,
            status: failure.status(),
            reason: Some(reason.into()),
            error: Some(failure.to_string()),
            report: None,
        }
    }
}

/// Whether an `Authorization` header carries `Bearer <secret>`.
pub fn bearer_matches(authorization: Option<&str>, secret: &str) -> bool {
    secret_matches(
        authorization
            .and_then(|h| h.trim().strip_prefix("Bearer "))
            .map(str::trim),
        secret,
    )
}

/// Whether a presented shared secret equals the configured one. Digests are
/// compared so the check does not short-circuit on the first differing byte.
pub fn secret_matches(given: Option<&str>, secret: &str) -> bool {
    given.is_some_and(|token| Sha256::digest(token.as_bytes()) == Sha256::digest(secret.as_bytes()))
}
