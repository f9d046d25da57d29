//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};
use crate::lead::LeadRecord;
use crate::types::{MessageContent, RateLimits};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Secrets may come from the environment instead of the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_secret("CADENCE_TRIGGER_SECRET") {
            self.trigger.secret = Some(v);
        }
        if let Some(v) = env_secret("CADENCE_WEBHOOK_SECRET") {
            self.webhook.shared_secret = Some(v);
        }
        if let Some(v) = env_secret("CADENCE_OPERATOR_TOKEN") {
            self.gateway.operator_token = Some(v);
        }
        if let Some(v) = env_secret("CADENCE_PROVIDER_API_KEY") {
            self.provider.api_key = v;
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }
}

fn env_secret(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn bool_true() -> bool { true }

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Guards operator routes (launch, control, approval) via `X-Operator-Token`.
    #[serde(default)]
    pub operator_token: Option<String>,
    #[serde(default = "bool_true")]
    pub cors: bool,
}

fn default_port() -> u16 { 3100 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            operator_token: None,
            cors: true,
        }
    }
}

/// Tick scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_runs_per_tick")]
    pub max_runs_per_tick: u32,
    /// Consecutive dispatch failures tolerated before a run fails.
    #[serde(default = "default_error_budget")]
    pub dispatch_error_budget: u32,
    /// Seconds a dispatch may stay unsettled before its lead is released.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_tick_interval() -> u64 { 60 }
fn default_max_runs_per_tick() -> u32 { 25 }
fn default_error_budget() -> u32 { 3 }
fn default_claim_lease() -> u64 { 600 }
fn default_db_path() -> String { "~/.cadence/cadence.db".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_runs_per_tick: default_max_runs_per_tick(),
            dispatch_error_budget: default_error_budget(),
            claim_lease_secs: default_claim_lease(),
            db_path: default_db_path(),
        }
    }
}

/// Invocation trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Base URL of the gateway exposing the tick entry point.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token for the manual trigger and the tick endpoint.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_nudge_interval")]
    pub nudge_min_interval_secs: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_step_ms() -> u64 { 1000 }
fn default_request_timeout() -> u64 { 30 }
fn default_nudge_interval() -> u64 { 15 }

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            secret: None,
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            request_timeout_secs: default_request_timeout(),
            nudge_min_interval_secs: default_nudge_interval(),
        }
    }
}

/// Lead-enrichment webhook configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// When set, inbound deliveries must carry it in `X-Webhook-Secret`.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

/// Send provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// `log` (dry run) or `webhook`.
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    /// Further webhook endpoints tried in order when the primary fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

fn default_provider_kind() -> String { "log".into() }
fn default_provider_timeout() -> u64 { 15 }

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            endpoint: String::new(),
            api_key: String::new(),
            timeout_secs: default_provider_timeout(),
            fallbacks: Vec::new(),
        }
    }
}

/// Seed data for the built-in campaign directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub campaigns: Vec<CampaignEntry>,
    #[serde(default)]
    pub experiments: Vec<ExperimentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEntry {
    pub id: String,
    pub brand_id: String,
    #[serde(default)]
    pub limits: RateLimits,
    #[serde(default)]
    pub experiments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub id: String,
    pub brand_id: String,
    pub message: MessageContent,
    #[serde(default)]
    pub leads: Vec<LeadRecord>,
    #[serde(default)]
    pub external_run_id: Option<String>,
}
