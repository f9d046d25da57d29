//! Send provider trait: the transport-level send is delegated here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lead::Lead;
use crate::types::{MessageContent, SendReceipt};

/// Reachability of one provider, as reported by `test_connectivity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub provider: String,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Transport that actually delivers a message.
///
/// Failures must be returned as [`crate::CadenceError::Provider`] with the
/// `retryable` flag set when a later attempt may succeed (rate limiting,
/// temporary unavailability, timeouts).
#[async_trait]
pub trait SendProvider: Send + Sync {
    /// Provider name, recorded in the send log.
    fn name(&self) -> &str;

    /// Deliver one message to one lead.
    async fn dispatch_send(&self, lead: &Lead, content: &MessageContent) -> Result<SendReceipt>;

    /// Check that the provider is reachable. `scope` narrows the check (e.g. a brand id) for
    /// providers that support it.
    async fn test_connectivity(&self, scope: &str) -> Result<Vec<ConnectivityReport>>;
}
