//! Provider failover: try primary → fallback₁ → fallback₂.
//!
//! Members over their failure threshold are skipped until a cooldown elapses.
//! Only retryable failures move on to the next member.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;

use cadence_core::error::{CadenceError, Result};
use cadence_core::lead::Lead;
use cadence_core::traits::{ConnectivityReport, SendProvider};
use cadence_core::types::{MessageContent, SendReceipt};

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-provider health tracking.
struct ProviderSlot {
    provider: Box<dyn SendProvider>,
    /// Consecutive failure count.
    failures: AtomicU32,
    /// Unix secs of the last failure, 0 = never failed.
    last_failure: AtomicU64,
    max_failures: u32,
    cooldown_secs: u64,
}

impl ProviderSlot {
    fn new(provider: Box<dyn SendProvider>, max_failures: u32, cooldown_secs: u64) -> Self {
        Self {
            provider,
            failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            max_failures,
            cooldown_secs,
        }
    }

    fn is_healthy_at(&self, now: u64) -> bool {
        if self.failures.load(Ordering::Relaxed) < self.max_failures {
            return true;
        }
        now.saturating_sub(self.last_failure.load(Ordering::Relaxed)) > self.cooldown_secs
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(unix_now(), Ordering::Relaxed);
    }
}

/// Health of one chain member.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MemberHealth {
    pub provider: String,
    pub healthy: bool,
    pub failures: u32,
}

pub struct FailoverProvider {
    slots: Vec<ProviderSlot>,
}

impl FailoverProvider {
    /// First provider is primary, the rest are fallbacks in order.
    pub fn new(providers: Vec<Box<dyn SendProvider>>) -> Result<Self> {
        Self::with_thresholds(providers, 3, 60)
    }

    pub fn with_thresholds(
        providers: Vec<Box<dyn SendProvider>>,
        max_failures: u32,
        cooldown_secs: u64,
    ) -> Result<Self> {
        if providers.is_empty() {
            return Err(CadenceError::Config("failover chain needs at least one provider".into()));
        }
        Ok(Self {
            slots: providers
                .into_iter()
                .map(|p| ProviderSlot::new(p, max_failures, cooldown_secs))
                .collect(),
        })
    }

    pub fn chain_len(&self) -> usize {
        self.slots.len()
    }

    pub fn health_status(&self) -> Vec<MemberHealth> {
        let now = unix_now();
        self.slots
            .iter()
            .map(|s| MemberHealth {
                provider: s.provider.name().to_string(),
                healthy: s.is_healthy_at(now),
                failures: s.failures.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[async_trait]
impl SendProvider for FailoverProvider {
    fn name(&self) -> &str {
        self.slots
            .first()
            .map(|s| s.provider.name())
            .unwrap_or("failover")
    }

    async fn dispatch_send(&self, lead: &Lead, content: &MessageContent) -> Result<SendReceipt> {
        let mut last_error = None;
        let mut any_retryable = false;
        let now = unix_now();

        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.is_healthy_at(now) {
                tracing::debug!(
                    "⏭️ Skipping unhealthy provider: {} ({} failures)",
                    slot.provider.name(),
                    slot.failures.load(Ordering::Relaxed)
                );
                any_retryable = true;
                continue;
            }

            match slot.provider.dispatch_send(lead, content).await {
                Ok(receipt) => {
                    if idx > 0 {
                        tracing::info!(
                            "🔄 Failover: {} → {} (success)",
                            self.slots[0].provider.name(),
                            slot.provider.name()
                        );
                    }
                    slot.record_success();
                    return Ok(receipt);
                }
                Err(e) => {
                    slot.record_failure();
                    tracing::warn!(
                        "⚠️ Provider {} failed (attempt {}): {}",
                        slot.provider.name(),
                        slot.failures.load(Ordering::Relaxed),
                        e
                    );
                    let retryable = e.is_retryable();
                    any_retryable |= retryable;
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(CadenceError::Provider { message, retryable }) => {
                CadenceError::provider(message, retryable && any_retryable)
            }
            Some(other) => other,
            None => CadenceError::provider("all providers unhealthy", true),
        })
    }

    async fn test_connectivity(&self, scope: &str) -> Result<Vec<ConnectivityReport>> {
        let mut reports = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match slot.provider.test_connectivity(scope).await {
                Ok(r) => reports.extend(r),
                Err(e) => reports.push(ConnectivityReport {
                    provider: slot.provider.name().to_string(),
                    reachable: false,
                    latency_ms: 0,
                    detail: Some(e.to_string()),
                }),
            }
        }
        Ok(reports)
    }
}
