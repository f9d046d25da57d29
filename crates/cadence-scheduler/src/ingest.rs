//! Lead-enrichment webhook ingestion.
//!
//! Deliveries are at-least-once and keyed by the external run id. Merging is
//! done under the run's lock, so concurrent deliveries for the same run see
//! each other's leads and never duplicate an email.

use std::sync::Arc;

use serde::Serialize;

use cadence_core::error::{CadenceError, Result};
use cadence_core::lead::LeadRecord;
use cadence_core::types::RunState;

use crate::pool::MergeEffect;
use crate::store::{Edit, RunStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub run_id: String,
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records without a usable email.
    pub rejected: usize,
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Merged(IngestReport),
    /// No run maps to the external id. Not an error for the caller.
    UnknownRun,
    /// The run already finished; the batch was not applied.
    RunClosed { run_id: String, state: RunState },
}

impl IngestOutcome {
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Merged(_) => None,
            Self::UnknownRun => Some("unknown_run"),
            Self::RunClosed { .. } => Some("run_closed"),
        }
    }
}

pub struct LeadIngestor {
    store: Arc<RunStore>,
}

impl LeadIngestor {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub fn ingest(&self, external_run_id: &str, records: Vec<LeadRecord>) -> Result<IngestOutcome> {
        let external_run_id = external_run_id.trim();
        if external_run_id.is_empty() {
            return Err(CadenceError::Validation("external run id is required".into()));
        }
        let Some(run_id) = self.store.resolve_external(external_run_id) else {
            tracing::info!("Ingest: no run for external id {external_run_id}, ignoring batch");
            return Ok(IngestOutcome::UnknownRun);
        };

        let received = records.len();
        let outcome = self.store.update(&run_id, |rec| {
            if rec.run.state.is_terminal() {
                return Ok(Edit::Keep(IngestOutcome::RunClosed {
                    run_id: rec.run.id.clone(),
                    state: rec.run.state,
                }));
            }

            let mut report = IngestReport {
                run_id: rec.run.id.clone(),
                received,
                ..IngestReport::default()
            };
            for record in records {
                let Some(lead) = record.normalize(Some(external_run_id)) else {
                    report.rejected += 1;
                    continue;
                };
                match rec.pool.merge(lead) {
                    MergeEffect::Inserted => report.inserted += 1,
                    MergeEffect::Updated => report.updated += 1,
                    MergeEffect::Unchanged => report.unchanged += 1,
                }
            }
            report.pool_size = rec.pool.len();

            if report.inserted + report.updated == 0 {
                Ok(Edit::Keep(IngestOutcome::Merged(report)))
            } else {
                Ok(Edit::Commit(IngestOutcome::Merged(report)))
            }
        })?;

        match &outcome {
            IngestOutcome::Merged(r) => tracing::info!(
                "📥 Run {}: ingested {} lead(s) from {external_run_id} (+{} new, {} updated, {} rejected, pool={})",
                r.run_id,
                r.received,
                r.inserted,
                r.updated,
                r.rejected,
                r.pool_size
            ),
            IngestOutcome::RunClosed { run_id, state } => tracing::info!(
                "Ingest: run {run_id} is {state}, batch from {external_run_id} not applied"
            ),
            IngestOutcome::UnknownRun => {}
        }
        Ok(outcome)
    }
}
