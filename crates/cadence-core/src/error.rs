//! Error taxonomy shared by every Cadence crate.
//!
//! Each variant maps onto one [`ErrorKind`] so callers (the HTTP gateway, the
//! trigger) can decide on status codes and retry behavior without matching on
//! individual variants. `reason()` is the stable machine-readable code that
//! leaves the process; the `Display` text is for logs.

use serde::Serialize;

use crate::types::RunState;

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input shape or missing field; rejected before any mutation.
    Validation,
    /// Referenced entity is absent.
    NotFound,
    /// Run state machine rejected the transition.
    IllegalTransition,
    /// Rate limits forbid a send right now. Expected; ticks skip, never raise.
    CapacityBlocked,
    /// Send provider failed (see [`CadenceError::is_retryable`]).
    ProviderFailure,
    /// Credential absent or mismatched.
    Unauthorized,
    /// Required endpoint or secret is not configured.
    ConfigurationMissing,
    /// Storage, IO or serialization trouble.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Campaign '{campaign_id}' has no runtime mapping for experiment '{experiment_id}'")]
    NotLinked {
        campaign_id: String,
        experiment_id: String,
    },

    #[error("Run '{run_id}' is already active for this campaign/experiment pair")]
    RunAlreadyActive { run_id: String },

    #[error("Illegal transition: cannot {action} a run that is {from}")]
    IllegalTransition { from: RunState, action: &'static str },

    #[error("Run '{run_id}' changed concurrently, gave up after retries")]
    Conflict { run_id: String },

    #[error("Draft '{draft_id}' was already sent")]
    AlreadySent { draft_id: String },

    #[error("Draft '{draft_id}' is being sent by another approval")]
    ApprovalInProgress { draft_id: String },

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CadenceError>;

impl CadenceError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            message: message.into(),
            retryable,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::NotLinked { .. }
            | Self::RunAlreadyActive { .. }
            | Self::AlreadySent { .. }
            | Self::ApprovalInProgress { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::IllegalTransition { .. } | Self::Conflict { .. } => ErrorKind::IllegalTransition,
            Self::Provider { .. } => ErrorKind::ProviderFailure,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            Self::Config(_) | Self::Database(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { entity, .. } => match *entity {
                "run" => "run_not_found",
                "campaign" => "campaign_not_found",
                "experiment" => "experiment_not_found",
                "draft" => "draft_not_found",
                _ => "not_found",
            },
            Self::NotLinked { .. } => "runtime_mapping_missing",
            Self::RunAlreadyActive { .. } => "run_already_active",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Conflict { .. } => "concurrent_modification",
            Self::AlreadySent { .. } => "already_sent",
            Self::ApprovalInProgress { .. } => "approval_in_progress",
            Self::Provider { .. } => "provider_failure",
            Self::Unauthorized(_) => "unauthorized",
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::Config(_) => "config_error",
            Self::Database(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Optional operator-facing hint.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotLinked { .. } => {
                Some("Link the experiment to the campaign runtime before launching a run.")
            }
            Self::RunAlreadyActive { .. } => {
                Some("Pause or cancel the active run, or wait for it to complete.")
            }
            Self::IllegalTransition { .. } => {
                Some("Completed, cancelled and failed runs cannot be changed.")
            }
            Self::Conflict { .. } => Some("Retry the request."),
            Self::ConfigurationMissing(_) => Some("Check the [trigger] section of config.toml."),
            _ => None,
        }
    }

    /// Structured context for operators, attached to failure responses.
    pub fn debug(&self) -> Option<serde_json::Value> {
        match self {
            Self::RunAlreadyActive { run_id } => Some(serde_json::json!({ "activeRunId": run_id })),
            Self::NotLinked {
                campaign_id,
                experiment_id,
            } => Some(serde_json::json!({
                "campaignId": campaign_id,
                "experimentId": experiment_id,
            })),
            Self::IllegalTransition { from, action } => {
                Some(serde_json::json!({ "state": from, "action": action }))
            }
            Self::NotFound { entity, id } => Some(serde_json::json!({ "entity": entity, "id": id })),
            _ => None,
        }
    }

    /// Whether a later attempt may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. } | Self::Conflict { .. })
    }
}
