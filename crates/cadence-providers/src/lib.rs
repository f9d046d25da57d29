//! # Cadence Providers
//!
//! Transport implementations of [`SendProvider`]:
//! - `log`: dry run, logs each message;
//! - `webhook`: JSON POST to an HTTP relay, failures classified by status;
//! - a failover chain when `[provider].fallbacks` lists further relays.

pub mod failover;
pub mod log;
pub mod webhook;

use std::sync::Arc;

use cadence_core::config::ProviderConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::SendProvider;

pub use failover::FailoverProvider;
pub use log::LogProvider;
pub use webhook::WebhookProvider;

/// Create the send provider described by `[provider]`.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn SendProvider>> {
    match config.kind.as_str() {
        "log" | "dry-run" => Ok(Arc::new(LogProvider::new())),
        "webhook" => {
            let primary =
                WebhookProvider::new("webhook", &config.endpoint, &config.api_key, config.timeout_secs)?;
            if config.fallbacks.is_empty() {
                return Ok(Arc::new(primary));
            }
            let mut chain: Vec<Box<dyn SendProvider>> = vec![Box::new(primary)];
            for (i, endpoint) in config.fallbacks.iter().enumerate() {
                chain.push(Box::new(WebhookProvider::new(
                    &format!("webhook-fallback-{}", i + 1),
                    endpoint,
                    &config.api_key,
                    config.timeout_secs,
                )?));
            }
            tracing::info!("Provider chain: {} relay(s)", chain.len());
            Ok(Arc::new(FailoverProvider::new(chain)?))
        }
        other => Err(CadenceError::Config(format!(
            "unknown provider kind '{other}' (available: {})",
            available_providers().join(", ")
        ))),
    }
}

/// List all available provider kinds.
pub fn available_providers() -> Vec<&'static str> {
    vec!["log", "webhook"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_dry_run() {
        let provider = create_provider(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.name(), "log");
    }

    #[test]
    fn test_webhook_with_fallbacks_builds_chain() {
        let config = ProviderConfig {
            kind: "webhook".into(),
            endpoint: "https://relay-a.example/send".into(),
            fallbacks: vec!["https://relay-b.example/send".into()],
            ..ProviderConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "webhook");
    }

    #[test]
    fn test_webhook_without_endpoint() {
        let config = ProviderConfig {
            kind: "webhook".into(),
            ..ProviderConfig::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert_eq!(err.reason(), "configuration_missing");
    }

    #[test]
    fn test_unknown_kind() {
        let config = ProviderConfig {
            kind: "carrier-pigeon".into(),
            ..ProviderConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
