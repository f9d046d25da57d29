//! Config-backed campaign directory.
//!
//! Stands in for the external brand/campaign/experiment store: campaigns and
//! experiments are read from the `[catalog]` config section, and message
//! templates are rendered with `{{name}}`, `{{first_name}}`, `{{company}}` and
//! `{{title}}` placeholders.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::config::CatalogConfig;
use crate::error::{CadenceError, Result};
use crate::lead::Lead;
use crate::traits::{CampaignDirectory, CampaignProfile, ContentSource, ExperimentProfile};
use crate::types::{MessageContent, Run};

struct ExperimentSlot {
    profile: ExperimentProfile,
    message: MessageContent,
}

/// In-memory directory.
#[derive(Default)]
pub struct Catalog {
    campaigns: RwLock<HashMap<String, CampaignProfile>>,
    experiments: RwLock<HashMap<String, ExperimentSlot>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        let catalog = Self::new();
        for c in &config.campaigns {
            catalog.upsert_campaign(CampaignProfile {
                id: c.id.clone(),
                brand_id: c.brand_id.clone(),
                limits: c.limits.clone(),
                experiment_ids: c.experiments.clone(),
            });
        }
        for e in &config.experiments {
            let source = e.external_run_id.as_deref();
            let mut leads: Vec<Lead> = Vec::with_capacity(e.leads.len());
            for record in e.leads.iter().cloned() {
                match record.normalize(source) {
                    Some(lead) if !leads.iter().any(|l| l.email == lead.email) => leads.push(lead),
                    Some(_) => {}
                    None => tracing::warn!("Catalog: skipping lead without usable email in experiment '{}'", e.id),
                }
            }
            catalog.upsert_experiment(
                ExperimentProfile {
                    id: e.id.clone(),
                    brand_id: e.brand_id.clone(),
                    leads,
                    external_run_id: e.external_run_id.clone(),
                },
                e.message.clone(),
            );
        }
        tracing::debug!(
            "Catalog loaded: {} campaigns, {} experiments",
            config.campaigns.len(),
            config.experiments.len()
        );
        catalog
    }

    pub fn upsert_campaign(&self, profile: CampaignProfile) {
        write(&self.campaigns).insert(profile.id.clone(), profile);
    }

    pub fn upsert_experiment(&self, profile: ExperimentProfile, message: MessageContent) {
        write(&self.experiments).insert(profile.id.clone(), ExperimentSlot { profile, message });
    }
}

// Every write is a single insert, so a poisoned map is still consistent.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl CampaignDirectory for Catalog {
    async fn campaign(&self, brand_id: &str, campaign_id: &str) -> Result<Option<CampaignProfile>> {
        Ok(read(&self.campaigns)
            .get(campaign_id)
            .filter(|c| c.brand_id == brand_id)
            .cloned())
    }

    async fn experiment(
        &self,
        brand_id: &str,
        experiment_id: &str,
    ) -> Result<Option<ExperimentProfile>> {
        Ok(read(&self.experiments)
            .get(experiment_id)
            .filter(|e| e.profile.brand_id == brand_id)
            .map(|e| e.profile.clone()))
    }
}

#[async_trait]
impl ContentSource for Catalog {
    async fn compose(&self, run: &Run, lead: &Lead) -> Result<MessageContent> {
        let map = read(&self.experiments);
        let slot = map
            .get(&run.experiment_id)
            .ok_or_else(|| CadenceError::not_found("experiment", run.experiment_id.clone()))?;
        Ok(MessageContent {
            subject: render(&slot.message.subject, lead),
            body: render(&slot.message.body, lead),
        })
    }
}

/// Substitute lead placeholders in a template.
pub fn render(template: &str, lead: &Lead) -> String {
    let name = lead.name.as_deref().unwrap_or("there");
    let first_name = name.split_whitespace().next().unwrap_or(name);
    template
        .replace("{{name}}", name)
        .replace("{{first_name}}", first_name)
        .replace("{{company}}", lead.company.as_deref().unwrap_or("your team"))
        .replace("{{title}}", lead.title.as_deref().unwrap_or(""))
        .replace("{{email}}", &lead.email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CampaignEntry, ExperimentEntry};
    use crate::lead::LeadRecord;
    use crate::types::RateLimits;

    fn config() -> CatalogConfig {
        CatalogConfig {
            campaigns: vec![CampaignEntry {
                id: "camp-1".into(),
                brand_id: "brand-1".into(),
                limits: RateLimits::default(),
                experiments: vec!["exp-1".into()],
            }],
            experiments: vec![ExperimentEntry {
                id: "exp-1".into(),
                brand_id: "brand-1".into(),
                message: MessageContent {
                    subject: "Hi {{first_name}}".into(),
                    body: "How is {{company}} doing?".into(),
                },
                leads: vec![
                    LeadRecord {
                        email: "Ann@Acme.io".into(),
                        name: Some("Ann Lee".into()),
                        company: Some("Acme".into()),
                        ..Default::default()
                    },
                    LeadRecord {
                        email: "ann@acme.io ".into(),
                        ..Default::default()
                    },
                    LeadRecord {
                        email: "broken".into(),
                        ..Default::default()
                    },
                ],
                external_run_id: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_catalog_lookup_scoped_by_brand() {
        let catalog = Catalog::from_config(&config());
        assert!(catalog.campaign("brand-1", "camp-1").await.unwrap().is_some());
        assert!(catalog.campaign("brand-2", "camp-1").await.unwrap().is_none());
        let exp = catalog.experiment("brand-1", "exp-1").await.unwrap().unwrap();
        // duplicate and invalid emails are dropped
        assert_eq!(exp.leads.len(), 1);
    }

    #[tokio::test]
    async fn test_upserts_survive_poisoned_lock() {
        let catalog = std::sync::Arc::new(Catalog::from_config(&config()));
        let held = catalog.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = held.campaigns.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(crashed.is_err());
        assert!(catalog.campaigns.is_poisoned());

        catalog.upsert_campaign(CampaignProfile {
            id: "camp-2".into(),
            brand_id: "brand-1".into(),
            limits: RateLimits::default(),
            experiment_ids: Vec::new(),
        });
        assert!(catalog.campaign("brand-1", "camp-2").await.unwrap().is_some());
        assert!(catalog.campaign("brand-1", "camp-1").await.unwrap().is_some());
    }

    #[test]
    fn test_render_placeholders() {
        let mut lead = Lead::from_email("ann@acme.io").unwrap();
        lead.name = Some("Ann Lee".into());
        assert_eq!(render("Hi {{first_name}} at {{company}}", &lead), "Hi Ann at your team");
    }
}
