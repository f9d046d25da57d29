//! Tick scheduler: advances eligible runs by at most one send each.
//!
//! Per run the work is split in three steps so no lock is held across the
//! provider call:
//! 1. claim: under the run lock, re-check state and capacity, pop the next
//!    pending lead and mark the run with a claim token;
//! 2. dispatch: compose the message and call the provider;
//! 3. settle: under the run lock again, apply the outcome if the claim is
//!    still ours.
//!
//! A run carrying a claim is skipped by every other tick, so concurrent ticks
//! never send the same lead twice. Steps 2 and 3 run in a spawned task that
//! outlives the tick future, and a claim still unsettled after the lease is
//! released by the next tick.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::error::{CadenceError, Result};
use cadence_core::lead::Lead;
use cadence_core::traits::{ContentSource, SendProvider};
use cadence_core::types::{Run, RunState, SendReceipt};

use crate::capacity;
use crate::persistence::{SchedulerDb, SendLogEntry, SendSubject};
use crate::state::{self, RunTransition};
use crate::store::{Claim, Edit, RunStore, RunSummary};

/// A per-run dispatch failure reported by a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickError {
    pub run_id: String,
    pub reason: String,
    pub message: String,
    pub retryable: bool,
}

/// Aggregate outcome of one tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    /// Runs that took a step (a dispatch attempt or completion).
    pub advanced: usize,
    /// Successful sends.
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Candidates passed over (capacity blocked or claimed elsewhere).
    pub skipped: usize,
    pub errors: Vec<TickError>,
    pub elapsed_ms: u64,
}

enum ClaimResult {
    Skip,
    Completed,
    Dispatch { token: String, lead: Lead, run: Run },
}

enum Settled {
    Sent,
    Failed { run_failed: bool },
    Stale,
}

/// Unsettled claims older than this are taken back by the next tick.
pub const DEFAULT_CLAIM_LEASE_MINUTES: i64 = 10;

/// What a dispatch task hands back to the tick that spawned it.
struct DispatchStep {
    settled: Result<Settled>,
    error: Option<TickError>,
}

/// The dispatch and settle half of a tick. Runs in its own task, so a caller
/// that stops waiting cannot leave a claim behind.
#[derive(Clone)]
struct Dispatcher {
    store: Arc<RunStore>,
    provider: Arc<dyn SendProvider>,
    content: Arc<dyn ContentSource>,
    db: Option<Arc<SchedulerDb>>,
    error_budget: u32,
}

pub struct TickScheduler {
    dispatcher: Dispatcher,
    claim_lease: Duration,
}

impl TickScheduler {
    pub fn new(
        store: Arc<RunStore>,
        provider: Arc<dyn SendProvider>,
        content: Arc<dyn ContentSource>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                store,
                provider,
                content,
                db: None,
                error_budget: 3,
            },
            claim_lease: Duration::minutes(DEFAULT_CLAIM_LEASE_MINUTES),
        }
    }

    /// Record every dispatch attempt in the send log.
    pub fn with_send_log(mut self, db: Arc<SchedulerDb>) -> Self {
        self.dispatcher.db = Some(db);
        self
    }

    /// Consecutive failures tolerated before a running run fails.
    pub fn with_error_budget(mut self, budget: u32) -> Self {
        self.dispatcher.error_budget = budget;
        self
    }

    /// How long a claim may stay unsettled before its lead is released.
    /// Keep it above the provider timeout.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.dispatcher.store
    }

    pub fn provider(&self) -> &Arc<dyn SendProvider> {
        &self.dispatcher.provider
    }

    /// Advance up to `max_runs` runs by one step.
    pub async fn tick(&self, max_runs: u32) -> Result<TickReport> {
        self.tick_at(max_runs, Utc::now()).await
    }

    /// [`TickScheduler::tick`] evaluated at a fixed instant.
    pub async fn tick_at(&self, max_runs: u32, now: DateTime<Utc>) -> Result<TickReport> {
        if max_runs == 0 {
            return Err(CadenceError::Validation(
                "max runs to advance must be a positive integer".into(),
            ));
        }
        let started = Instant::now();
        let mut report = TickReport::default();

        let mut candidates: Vec<RunSummary> = Vec::new();
        for summary in self.store().active_summaries() {
            let held = summary
                .claim
                .as_ref()
                .is_some_and(|c| !c.is_expired(now, self.claim_lease));
            if held || !capacity::evaluate(&summary.limits, &summary.pacing, now).is_allowed() {
                report.skipped += 1;
                continue;
            }
            candidates.push(summary);
        }
        // Fairness: the run that waited longest since its last send goes first.
        candidates.sort_by(|a, b| {
            a.pacing
                .last_send_at
                .cmp(&b.pacing.last_send_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.run_id.cmp(&b.run_id))
        });

        for candidate in candidates {
            if report.advanced >= max_runs as usize {
                break;
            }
            let run_id = candidate.run_id;
            match self.claim(&run_id, now) {
                Ok(ClaimResult::Skip) => report.skipped += 1,
                Ok(ClaimResult::Completed) => {
                    report.advanced += 1;
                    report.completed += 1;
                }
                Ok(ClaimResult::Dispatch { token, lead, run }) => {
                    report.advanced += 1;
                    let dispatcher = self.dispatcher.clone();
                    let task = tokio::spawn(async move {
                        dispatcher.dispatch(run, token, lead, now, started).await
                    });
                    match task.await {
                        Ok(step) => step.apply(&run_id, &mut report),
                        Err(e) => tracing::error!("❌ Run {run_id}: dispatch task died: {e}"),
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ Run {run_id}: claim failed: {e}");
                    report.errors.push(TickError {
                        run_id,
                        reason: e.reason().into(),
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.advanced > 0 || !report.errors.is_empty() {
            tracing::info!(
                "Tick: advanced={} dispatched={} completed={} failed={} skipped={} errors={} ({}ms)",
                report.advanced,
                report.dispatched,
                report.completed,
                report.failed,
                report.skipped,
                report.errors.len(),
                report.elapsed_ms
            );
        } else {
            tracing::debug!("Tick: nothing to do (skipped={})", report.skipped);
        }
        Ok(report)
    }

    /// Step 1: atomic read-check-write on the run.
    fn claim(&self, run_id: &str, now: DateTime<Utc>) -> Result<ClaimResult> {
        let lease = self.claim_lease;
        self.store().update(run_id, |rec| {
            if !matches!(rec.run.state, RunState::Queued | RunState::Running) {
                return Ok(Edit::Keep(ClaimResult::Skip));
            }
            let mut released = false;
            if let Some(held) = rec.claim.take() {
                if !held.is_expired(now, lease) {
                    return Ok(Edit::Keep(ClaimResult::Skip));
                }
                tracing::warn!(
                    "⚠️ Run {}: claim on {} from {} never settled, releasing the lead",
                    rec.run.id,
                    held.lead_email,
                    held.claimed_at
                );
                rec.pool.release(&held.lead_email);
                released = true;
            }
            if !capacity::evaluate(&rec.run.limits, &rec.run.pacing, now).is_allowed() {
                return Ok(if released {
                    Edit::Commit(ClaimResult::Skip)
                } else {
                    Edit::Keep(ClaimResult::Skip)
                });
            }
            if rec.run.state == RunState::Queued {
                state::apply(&mut rec.run, RunTransition::Start)?;
            }
            match rec.pool.claim_next() {
                None => {
                    state::apply(&mut rec.run, RunTransition::Complete)?;
                    Ok(Edit::Commit(ClaimResult::Completed))
                }
                Some(lead) => {
                    let claim = Claim::new(&lead.email, now);
                    let token = claim.token.clone();
                    rec.claim = Some(claim);
                    Ok(Edit::Commit(ClaimResult::Dispatch {
                        token,
                        lead,
                        run: rec.run.clone(),
                    }))
                }
            }
        })
    }
}

impl DispatchStep {
    fn apply(self, run_id: &str, report: &mut TickReport) {
        match self.settled {
            Ok(Settled::Sent) => report.dispatched += 1,
            Ok(Settled::Failed { run_failed }) => {
                if run_failed {
                    report.failed += 1;
                }
            }
            Ok(Settled::Stale) => {
                tracing::warn!("⚠️ Run {run_id}: claim was lost before settling");
            }
            Err(e) => tracing::warn!("⚠️ Run {run_id}: settle failed: {e}"),
        }
        if let Some(error) = self.error {
            report.errors.push(error);
        }
    }
}

/// When a send finished, on the tick's clock. Whole seconds, so a send that
/// returns at once is recorded at the tick instant.
fn sent_at(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    let elapsed = i64::try_from(started.elapsed().as_secs()).unwrap_or_default();
    now + Duration::try_seconds(elapsed).unwrap_or_default()
}

impl Dispatcher {
    /// Steps 2 and 3.
    async fn dispatch(
        self,
        run: Run,
        token: String,
        lead: Lead,
        now: DateTime<Utc>,
        started: Instant,
    ) -> DispatchStep {
        let outcome = match self.content.compose(&run, &lead).await {
            Ok(content) => self.provider.dispatch_send(&lead, &content).await,
            Err(e) => Err(e),
        };

        if let Some(db) = &self.db {
            let entry = match &outcome {
                Ok(receipt) => SendLogEntry::sent(SendSubject::Run, &run.id, &lead.email, receipt),
                Err(e) => SendLogEntry::failed(
                    SendSubject::Run,
                    &run.id,
                    &lead.email,
                    self.provider.name(),
                    e,
                ),
            };
            db.log_send(&entry);
        }

        let settled = self.settle(&run.id, &token, &lead.email, &outcome, sent_at(now, started));
        DispatchStep {
            settled,
            error: outcome.err().map(|e| TickError {
                run_id: run.id.clone(),
                reason: e.reason().into(),
                message: e.to_string(),
                retryable: e.is_retryable(),
            }),
        }
    }

    fn settle(
        &self,
        run_id: &str,
        token: &str,
        email: &str,
        outcome: &Result<SendReceipt>,
        sent_at: DateTime<Utc>,
    ) -> Result<Settled> {
        let budget = self.error_budget;
        self.store.update(run_id, |rec| {
            if rec.claim.as_ref().map(|c| c.token.as_str()) != Some(token) {
                return Ok(Edit::Keep(Settled::Stale));
            }
            rec.claim = None;
            rec.run.updated_at = Utc::now();

            match outcome {
                Ok(receipt) => {
                    capacity::record_send(&rec.run.limits, &mut rec.run.pacing, sent_at);
                    rec.pool.mark_contacted(email, receipt.accepted_at);
                    rec.run.consecutive_failures = 0;
                    tracing::info!(
                        "📤 Run {}: sent to {} via {}",
                        rec.run.id,
                        email,
                        receipt.provider
                    );
                    Ok(Edit::Commit(Settled::Sent))
                }
                Err(e) => {
                    if e.is_retryable() {
                        rec.pool.release(email);
                    } else {
                        rec.pool.mark_failed(email);
                    }
                    rec.run.consecutive_failures += 1;
                    rec.run.last_error = Some(e.to_string());
                    tracing::warn!(
                        "⚠️ Run {}: send to {} failed ({}/{} consecutive): {e}",
                        rec.run.id,
                        email,
                        rec.run.consecutive_failures,
                        budget
                    );

                    let mut run_failed = false;
                    if rec.run.consecutive_failures > budget && rec.run.state == RunState::Running {
                        state::apply(&mut rec.run, RunTransition::Fail)?;
                        run_failed = true;
                    }
                    Ok(Edit::Commit(Settled::Failed { run_failed }))
                }
            }
        })
    }
}
