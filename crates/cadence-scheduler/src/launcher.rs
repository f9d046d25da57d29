//! Run launcher: validates a launch against the campaign directory and
//! creates the run in one step. A rejected launch creates nothing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::CampaignDirectory;
use cadence_core::types::{OwnerType, RateLimits, Run, RunOwner, RunState, TriggerOrigin};

use crate::pool::LeadPool;
use crate::store::{RunRecord, RunStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    #[serde(alias = "brandId")]
    pub brand_id: String,
    #[serde(alias = "campaignId")]
    pub campaign_id: String,
    #[serde(alias = "experimentId")]
    pub experiment_id: String,
    #[serde(default = "default_trigger")]
    pub trigger: TriggerOrigin,
    pub owner: RunOwner,
    /// Sourcing-pipeline run to correlate enrichment callbacks with.
    #[serde(default, alias = "externalRunId")]
    pub external_run_id: Option<String>,
}

fn default_trigger() -> TriggerOrigin {
    TriggerOrigin::Manual
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReceipt {
    pub run_id: String,
    pub state: RunState,
    pub leads_seeded: usize,
    pub limits: RateLimits,
}

pub struct RunLauncher {
    store: Arc<RunStore>,
    directory: Arc<dyn CampaignDirectory>,
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CadenceError::Validation(format!("{field} is required")));
    }
    Ok(())
}

impl RunLauncher {
    pub fn new(store: Arc<RunStore>, directory: Arc<dyn CampaignDirectory>) -> Self {
        Self { store, directory }
    }

    pub async fn launch(&self, req: LaunchRequest) -> Result<LaunchReceipt> {
        required("brand_id", &req.brand_id)?;
        required("campaign_id", &req.campaign_id)?;
        required("experiment_id", &req.experiment_id)?;
        required("owner.owner_id", &req.owner.owner_id)?;

        let expected_owner = match req.owner.owner_type {
            OwnerType::Campaign => &req.campaign_id,
            OwnerType::Experiment => &req.experiment_id,
        };
        if &req.owner.owner_id != expected_owner {
            return Err(CadenceError::Validation(format!(
                "owner '{}' does not match the launched {}",
                req.owner.owner_id,
                match req.owner.owner_type {
                    OwnerType::Campaign => "campaign",
                    OwnerType::Experiment => "experiment",
                }
            )));
        }

        let campaign = self
            .directory
            .campaign(&req.brand_id, &req.campaign_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("campaign", &req.campaign_id))?;
        let experiment = self
            .directory
            .experiment(&req.brand_id, &req.experiment_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("experiment", &req.experiment_id))?;

        if !campaign.is_linked_to(&experiment.id) {
            return Err(CadenceError::NotLinked {
                campaign_id: campaign.id,
                experiment_id: experiment.id,
            });
        }
        campaign.limits.validate()?;

        // The limits are copied into the run; later campaign edits do not reach it.
        let mut run = Run::new(
            &req.brand_id,
            &campaign.id,
            &experiment.id,
            req.owner,
            req.trigger,
            campaign.limits.clone(),
        );
        run.external_run_id = req
            .external_run_id
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .or(experiment.external_run_id);

        let pool = LeadPool::seeded(experiment.leads);
        let record = self.store.insert_if_no_active(RunRecord::new(run, pool))?;

        tracing::info!(
            "🚀 Run {} launched: campaign={} experiment={} leads={} trigger={:?}",
            record.run.id,
            record.run.campaign_id,
            record.run.experiment_id,
            record.pool.len(),
            record.run.trigger
        );
        Ok(LaunchReceipt {
            run_id: record.run.id.clone(),
            state: record.run.state,
            leads_seeded: record.pool.len(),
            limits: record.run.limits,
        })
    }
}
