//! Domain types: runs, pacing snapshots, reply drafts.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::lead::Lead;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl RunState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Active runs block a second launch for the same campaign/experiment pair.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Campaign,
    Experiment,
}

/// The entity a run was launched on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOwner {
    #[serde(alias = "ownerType")]
    pub owner_type: OwnerType,
    #[serde(alias = "ownerId")]
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    Manual,
    Scheduled,
}

/// Rate-limit policy, snapshotted into a run at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub daily_cap: u32,
    pub hourly_cap: u32,
    #[serde(default)]
    pub min_spacing_minutes: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            daily_cap: 50,
            hourly_cap: 10,
            min_spacing_minutes: 2,
            timezone: default_timezone(),
        }
    }
}

impl RateLimits {
    /// Parse the configured IANA timezone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| CadenceError::Validation(format!("unknown timezone '{}'", self.timezone)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.daily_cap == 0 {
            return Err(CadenceError::Validation("daily_cap must be positive".into()));
        }
        if self.hourly_cap == 0 {
            return Err(CadenceError::Validation("hourly_cap must be positive".into()));
        }
        self.tz().map(|_| ())
    }
}

/// Send counters of a run. The window keys are local (run timezone) date and
/// hour the counters belong to; a stale window means the counter reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingCounters {
    pub sends_today: u32,
    pub sends_this_hour: u32,
    pub last_send_at: Option<DateTime<Utc>>,
    pub day_window: Option<NaiveDate>,
    pub hour_window: Option<NaiveDateTime>,
}

/// One execution of an experiment against its lead pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub brand_id: String,
    pub campaign_id: String,
    pub experiment_id: String,
    pub owner: RunOwner,
    pub trigger: TriggerOrigin,
    pub state: RunState,
    pub limits: RateLimits,
    #[serde(default)]
    pub pacing: PacingCounters,
    /// Id assigned by the external lead-sourcing pipeline.
    #[serde(default)]
    pub external_run_id: Option<String>,
    /// Consecutive dispatch failures, compared against the error budget.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Operator-supplied reason for the last control action.
    #[serde(default)]
    pub state_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        brand_id: &str,
        campaign_id: &str,
        experiment_id: &str,
        owner: RunOwner,
        trigger: TriggerOrigin,
        limits: RateLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("run-{}", uuid::Uuid::new_v4().simple()),
            brand_id: brand_id.to_string(),
            campaign_id: campaign_id.to_string(),
            experiment_id: experiment_id.to_string(),
            owner,
            trigger,
            state: RunState::Queued,
            limits,
            pacing: PacingCounters::default(),
            external_run_id: None,
            consecutive_failures: 0,
            last_error: None,
            state_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Message content produced upstream of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: String,
    pub body: String,
}

/// Successful provider dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider: String,
    pub message_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

/// Operator commands accepted by run control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

impl std::str::FromStr for ControlAction {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            other => Err(CadenceError::Validation(format!(
                "unknown action '{other}' (expected pause, resume or cancel)"
            ))),
        }
    }
}

/// Reply draft lifecycle. `Sending` is the short-lived claim held while an
/// approval dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftState {
    AwaitingApproval,
    Sending,
    Sent,
}

impl DraftState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingApproval => "awaiting_approval",
            Self::Sending => "sending",
            Self::Sent => "sent",
        }
    }
}

/// A generated reply waiting for a human to approve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyDraft {
    pub id: String,
    pub brand_id: String,
    pub thread_id: String,
    pub recipient: Lead,
    pub content: MessageContent,
    pub state: DraftState,
    pub created_at: DateTime<Utc>,
    /// Set while an approval holds the draft in `sending`.
    #[serde(default)]
    pub sending_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ReplyDraft {
    pub fn new(brand_id: &str, thread_id: &str, recipient: Lead, content: MessageContent) -> Self {
        Self {
            id: format!("draft-{}", uuid::Uuid::new_v4().simple()),
            brand_id: brand_id.to_string(),
            thread_id: thread_id.to_string(),
            recipient,
            content,
            state: DraftState::AwaitingApproval,
            created_at: Utc::now(),
            sending_since: None,
            sent_at: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Paused.is_active());
        assert!(RunState::Queued.is_active());
    }

    #[test]
    fn test_rate_limit_validation() {
        let mut limits = RateLimits::default();
        assert!(limits.validate().is_ok());
        limits.timezone = "Mars/Olympus".into();
        assert!(limits.validate().is_err());
        limits.timezone = "Asia/Ho_Chi_Minh".into();
        limits.daily_cap = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_control_action_parse() {
        assert_eq!("Pause".parse::<ControlAction>().unwrap(), ControlAction::Pause);
        assert_eq!(" cancel ".parse::<ControlAction>().unwrap(), ControlAction::Cancel);
        assert!("archive".parse::<ControlAction>().is_err());
    }

    #[test]
    fn test_run_state_serde() {
        let json = serde_json::to_string(&RunState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        let owner: RunOwner =
            serde_json::from_str(r#"{"ownerType":"experiment","ownerId":"exp-1"}"#).unwrap();
        assert_eq!(owner.owner_type, OwnerType::Experiment);
    }
}
