//! Campaign/experiment directory and content source.
//!
//! Campaign and experiment storage live outside Cadence; the launcher and the
//! tick only read them through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lead::Lead;
use crate::types::{MessageContent, RateLimits, Run};

/// Runtime view of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProfile {
    pub id: String,
    pub brand_id: String,
    pub limits: RateLimits,
    /// Experiments this campaign has a runtime mapping for.
    pub experiment_ids: Vec<String>,
}

impl CampaignProfile {
    pub fn is_linked_to(&self, experiment_id: &str) -> bool {
        self.experiment_ids.iter().any(|id| id == experiment_id)
    }
}

/// Runtime view of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentProfile {
    pub id: String,
    pub brand_id: String,
    pub leads: Vec<Lead>,
    /// Id of the sourcing-pipeline run feeding this experiment, if any.
    pub external_run_id: Option<String>,
}

#[async_trait]
pub trait CampaignDirectory: Send + Sync {
    async fn campaign(&self, brand_id: &str, campaign_id: &str) -> Result<Option<CampaignProfile>>;

    async fn experiment(
        &self,
        brand_id: &str,
        experiment_id: &str,
    ) -> Result<Option<ExperimentProfile>>;
}

/// Produces the message for a lead of a run. Content decisions are upstream.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn compose(&self, run: &Run, lead: &Lead) -> Result<MessageContent>;
}
