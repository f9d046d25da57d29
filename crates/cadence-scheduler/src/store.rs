//! Run arena: every run record behind its own lock, indexed by run id.
//!
//! Mutations go through [`RunStore::update`] or [`RunStore::compare_and_swap`]:
//! the closure edits a copy of the record, and the copy replaces the stored
//! one (with a bumped version) only when the closure commits. A closure that
//! errors or keeps leaves the stored record exactly as it was.
//!
//! Locks are held for in-memory work only. Provider calls happen outside, with
//! the record carrying a [`Claim`] so that other ticks skip it meanwhile.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{PacingCounters, RateLimits, Run, RunState};

use crate::capacity::{self, CapacityVerdict};
use crate::persistence::SchedulerDb;
use crate::pool::{LeadPool, PoolStats};

/// An in-flight dispatch holding one lead of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: String,
    pub lead_email: String,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(lead_email: &str, now: DateTime<Utc>) -> Self {
        Self {
            token: uuid::Uuid::new_v4().simple().to_string(),
            lead_email: lead_email.to_string(),
            claimed_at: now,
        }
    }

    /// A claim older than `lease` belongs to a dispatch that never settled.
    pub fn is_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        now - self.claimed_at >= lease
    }
}

/// A run plus everything that is mutated together with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: Run,
    pub pool: LeadPool,
    #[serde(default)]
    pub claim: Option<Claim>,
    /// Bumped on every committed change.
    pub version: u64,
}

impl RunRecord {
    pub fn new(run: Run, pool: LeadPool) -> Self {
        Self {
            run,
            pool,
            claim: None,
            version: 1,
        }
    }
}

/// What an edit closure wants done with its copy.
pub enum Edit<T> {
    /// Store the copy and bump the version.
    Commit(T),
    /// Drop the copy; the stored record is unchanged.
    Keep(T),
}

/// Read-only view of a run for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run: Run,
    pub pool: PoolStats,
    pub verdict: CapacityVerdict,
    pub sends_today: u32,
    pub sends_this_hour: u32,
    pub next_send_not_before: Option<DateTime<Utc>>,
    pub dispatch_in_flight: bool,
    pub version: u64,
}

impl RunStatus {
    pub fn of(record: &RunRecord, now: DateTime<Utc>) -> Self {
        let (sends_today, sends_this_hour) =
            capacity::effective_counts(&record.run.limits, &record.run.pacing, now);
        Self {
            run: record.run.clone(),
            pool: record.pool.stats(),
            verdict: capacity::evaluate(&record.run.limits, &record.run.pacing, now),
            sends_today,
            sends_this_hour,
            next_send_not_before: capacity::spacing_ready_at(&record.run.limits, &record.run.pacing),
            dispatch_in_flight: record.claim.is_some(),
            version: record.version,
        }
    }
}

/// The fields a tick needs to pick its candidates.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub state: RunState,
    pub limits: RateLimits,
    pub pacing: PacingCounters,
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
}

type Slot = Arc<Mutex<RunRecord>>;

pub struct RunStore {
    slots: RwLock<HashMap<String, Slot>>,
    /// External sourcing run id → run id.
    external: RwLock<HashMap<String, String>>,
    /// Serializes launches so the active-pair check and the insert are atomic.
    launch_gate: Mutex<()>,
    db: Option<Arc<SchedulerDb>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(m: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(m: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    m.write().unwrap_or_else(|e| e.into_inner())
}

impl RunStore {
    /// Arena without persistence.
    pub fn in_memory() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            external: RwLock::new(HashMap::new()),
            launch_gate: Mutex::new(()),
            db: None,
        }
    }

    /// Arena writing through to `db`. Call [`RunStore::restore`] to load it.
    pub fn persistent(db: Arc<SchedulerDb>) -> Self {
        Self {
            db: Some(db),
            ..Self::in_memory()
        }
    }

    /// Load every stored run. Claims left over from a previous process are
    /// released, their leads go back to pending.
    pub fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let records = db.load_runs()?;
        let count = records.len();
        for mut record in records {
            let released = record.pool.release_all_claims();
            if record.claim.take().is_some() || released > 0 {
                tracing::warn!(
                    "Run {}: released {released} claim(s) left by a previous process",
                    record.run.id
                );
                record.version += 1;
                self.persist(&record);
            }
            if let Some(ext) = &record.run.external_run_id {
                write(&self.external).insert(ext.clone(), record.run.id.clone());
            }
            write(&self.slots).insert(record.run.id.clone(), Arc::new(Mutex::new(record)));
        }
        tracing::info!("📂 Restored {count} run(s) from storage");
        Ok(count)
    }

    fn slot(&self, run_id: &str) -> Option<Slot> {
        read(&self.slots).get(run_id).cloned()
    }

    fn slots(&self) -> Vec<Slot> {
        read(&self.slots).values().cloned().collect()
    }

    /// True when `run_id` exists and has not reached a terminal state.
    fn is_live(&self, run_id: &str) -> bool {
        self.slot(run_id)
            .is_some_and(|slot| lock(&slot).run.state.is_active())
    }

    fn persist(&self, record: &RunRecord) {
        if let Some(db) = &self.db
            && let Err(e) = db.save_run(record)
        {
            tracing::warn!("⚠️ Failed to persist run {}: {e}", record.run.id);
        }
    }

    pub fn len(&self) -> usize {
        read(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record.
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.slot(run_id).map(|slot| lock(&slot).clone())
    }

    /// Snapshots of all records, oldest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self.slots().iter().map(|s| lock(s).clone()).collect();
        records.sort_by(|a, b| {
            a.run
                .created_at
                .cmp(&b.run.created_at)
                .then_with(|| a.run.id.cmp(&b.run.id))
        });
        records
    }

    /// Summaries of the queued and running runs. Lead pools are not copied.
    pub fn active_summaries(&self) -> Vec<RunSummary> {
        self.slots()
            .iter()
            .filter_map(|slot| {
                let rec = lock(slot);
                matches!(rec.run.state, RunState::Queued | RunState::Running).then(|| RunSummary {
                    run_id: rec.run.id.clone(),
                    state: rec.run.state,
                    limits: rec.run.limits.clone(),
                    pacing: rec.run.pacing.clone(),
                    claim: rec.claim.clone(),
                    created_at: rec.run.created_at,
                })
            })
            .collect()
    }

    pub fn list_by_brand(&self, brand_id: &str) -> Vec<RunRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.run.brand_id == brand_id)
            .collect()
    }

    pub fn status(&self, run_id: &str, now: DateTime<Utc>) -> Option<RunStatus> {
        self.slot(run_id).map(|slot| RunStatus::of(&lock(&slot), now))
    }

    /// Insert a new record unless another active run exists for the same
    /// campaign/experiment pair.
    pub fn insert_if_no_active(&self, record: RunRecord) -> Result<RunRecord> {
        let _gate = lock(&self.launch_gate);

        let active = self.slots().iter().find_map(|slot| {
            let r = lock(slot);
            (r.run.campaign_id == record.run.campaign_id
                && r.run.experiment_id == record.run.experiment_id
                && r.run.state.is_active())
            .then(|| r.run.id.clone())
        });
        if let Some(run_id) = active {
            return Err(CadenceError::RunAlreadyActive { run_id });
        }

        if let Some(ext) = &record.run.external_run_id {
            let mut external = write(&self.external);
            if let Some(owner) = external.get(ext)
                && owner != &record.run.id
            {
                if self.is_live(owner) {
                    return Err(CadenceError::Validation(format!(
                        "external run id '{ext}' is already linked to run '{owner}'"
                    )));
                }
                tracing::info!(
                    "External run {ext} moves from finished run {owner} to {}",
                    record.run.id
                );
            }
            external.insert(ext.clone(), record.run.id.clone());
        }

        write(&self.slots).insert(
            record.run.id.clone(),
            Arc::new(Mutex::new(record.clone())),
        );
        self.persist(&record);
        Ok(record)
    }

    /// Edit a record under its lock.
    pub fn update<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunRecord) -> Result<Edit<T>>,
    ) -> Result<T> {
        self.edit(run_id, None, f)
    }

    /// Like [`RunStore::update`], but only when the stored version is still
    /// `expected_version`; otherwise fails with a conflict.
    pub fn compare_and_swap<T>(
        &self,
        run_id: &str,
        expected_version: u64,
        f: impl FnOnce(&mut RunRecord) -> Result<Edit<T>>,
    ) -> Result<T> {
        self.edit(run_id, Some(expected_version), f)
    }

    fn edit<T>(
        &self,
        run_id: &str,
        expected_version: Option<u64>,
        f: impl FnOnce(&mut RunRecord) -> Result<Edit<T>>,
    ) -> Result<T> {
        let slot = self
            .slot(run_id)
            .ok_or_else(|| CadenceError::not_found("run", run_id))?;

        let committed = {
            let mut guard = lock(&slot);
            if let Some(expected) = expected_version
                && guard.version != expected
            {
                return Err(CadenceError::Conflict {
                    run_id: run_id.to_string(),
                });
            }
            let mut draft = guard.clone();
            match f(&mut draft)? {
                Edit::Keep(value) => return Ok(value),
                Edit::Commit(value) => {
                    draft.version = guard.version + 1;
                    *guard = draft;
                    (value, guard.clone())
                }
            }
        };

        let (value, snapshot) = committed;
        self.persist(&snapshot);
        Ok(value)
    }

    pub fn resolve_external(&self, external_run_id: &str) -> Option<String> {
        read(&self.external).get(external_run_id).cloned()
    }

    /// Attach an external sourcing run id to a run. One external id maps to
    /// at most one live run; relinking a run drops its previous mapping, and
    /// an id held by a finished run may be taken over.
    pub fn link_external(&self, run_id: &str, external_run_id: &str) -> Result<RunRecord> {
        let ext = external_run_id.trim();
        if ext.is_empty() {
            return Err(CadenceError::Validation("external run id is required".into()));
        }

        let mut external = write(&self.external);
        if let Some(owner) = external.get(ext)
            && owner != run_id
            && self.is_live(owner)
        {
            return Err(CadenceError::Validation(format!(
                "external run id '{ext}' is already linked to run '{owner}'"
            )));
        }

        let (previous, record) = self.update(run_id, |rec| {
            let previous = rec.run.external_run_id.replace(ext.to_string());
            rec.run.updated_at = Utc::now();
            Ok(Edit::Commit((previous, rec.clone())))
        })?;

        if let Some(prev) = previous
            && prev != ext
        {
            external.remove(&prev);
        }
        external.insert(ext.to_string(), run_id.to_string());
        tracing::info!("Run {run_id} linked to external run {ext}");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::lead::Lead;
    use cadence_core::types::{OwnerType, RateLimits, RunOwner, RunState, TriggerOrigin};

    fn record(campaign: &str, experiment: &str) -> RunRecord {
        let run = Run::new(
            "brand-1",
            campaign,
            experiment,
            RunOwner {
                owner_type: OwnerType::Campaign,
                owner_id: campaign.into(),
            },
            TriggerOrigin::Manual,
            RateLimits::default(),
        );
        RunRecord::new(run, LeadPool::seeded([Lead::from_email("a@acme.io").unwrap()]))
    }

    #[test]
    fn test_insert_rejects_second_active_pair() {
        let store = RunStore::in_memory();
        let first = store.insert_if_no_active(record("c1", "e1")).unwrap();
        let err = store.insert_if_no_active(record("c1", "e1")).unwrap_err();
        assert_eq!(err.reason(), "run_already_active");
        assert_eq!(store.len(), 1);

        // A different pair is fine.
        store.insert_if_no_active(record("c1", "e2")).unwrap();

        // Once the first is terminal the pair may launch again.
        store
            .update(&first.run.id, |r| {
                r.run.state = RunState::Cancelled;
                Ok(Edit::Commit(()))
            })
            .unwrap();
        store.insert_if_no_active(record("c1", "e1")).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_update_commit_bumps_version_and_errors_leave_record() {
        let store = RunStore::in_memory();
        let rec = store.insert_if_no_active(record("c1", "e1")).unwrap();
        let id = rec.run.id.clone();

        let res: Result<()> = store.update(&id, |r| {
            r.run.state = RunState::Failed;
            Err(CadenceError::Validation("nope".into()))
        });
        assert!(res.is_err());
        let stored = store.get(&id).unwrap();
        assert_eq!(stored.run.state, RunState::Queued);
        assert_eq!(stored.version, 1);

        store
            .update(&id, |r| {
                r.run.state = RunState::Running;
                Ok(Edit::Keep(()))
            })
            .unwrap();
        assert_eq!(store.get(&id).unwrap().run.state, RunState::Queued);

        store
            .update(&id, |r| {
                r.run.state = RunState::Running;
                Ok(Edit::Commit(()))
            })
            .unwrap();
        let stored = store.get(&id).unwrap();
        assert_eq!(stored.run.state, RunState::Running);
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_compare_and_swap_rejects_stale_version() {
        let store = RunStore::in_memory();
        let id = store.insert_if_no_active(record("c1", "e1")).unwrap().run.id;
        store.compare_and_swap(&id, 1, |_| Ok(Edit::Commit(()))).unwrap();
        let err = store
            .compare_and_swap(&id, 1, |_| Ok(Edit::Commit(())))
            .unwrap_err();
        assert_eq!(err.reason(), "concurrent_modification");
        assert_eq!(store.get(&id).unwrap().version, 2);
    }

    #[test]
    fn test_update_unknown_run() {
        let store = RunStore::in_memory();
        let err = store.update("run-missing", |_| Ok(Edit::Commit(()))).unwrap_err();
        assert_eq!(err.reason(), "run_not_found");
    }

    #[test]
    fn test_external_links_are_unique() {
        let store = RunStore::in_memory();
        let a = store.insert_if_no_active(record("c1", "e1")).unwrap().run.id;
        let b = store.insert_if_no_active(record("c2", "e1")).unwrap().run.id;

        store.link_external(&a, "apify-1").unwrap();
        assert_eq!(store.resolve_external("apify-1").as_deref(), Some(a.as_str()));
        assert!(store.link_external(&b, "apify-1").is_err());

        // Relinking moves the mapping.
        store.link_external(&a, "apify-2").unwrap();
        assert!(store.resolve_external("apify-1").is_none());
        assert_eq!(
            store.get(&a).unwrap().run.external_run_id.as_deref(),
            Some("apify-2")
        );
        store.link_external(&b, "apify-1").unwrap();
    }

    #[test]
    fn test_external_id_is_released_by_finished_run() {
        let store = RunStore::in_memory();
        let mut first = record("c1", "e1");
        first.run.external_run_id = Some("apify-1".into());
        let first = store.insert_if_no_active(first).unwrap().run.id;
        let other = store.insert_if_no_active(record("c2", "e1")).unwrap().run.id;

        let mut second = record("c1", "e2");
        second.run.external_run_id = Some("apify-1".into());
        assert!(store.insert_if_no_active(second.clone()).is_err());
        assert!(store.link_external(&other, "apify-1").is_err());

        store
            .update(&first, |r| {
                r.run.state = RunState::Completed;
                Ok(Edit::Commit(()))
            })
            .unwrap();
        let second = store.insert_if_no_active(second).unwrap().run.id;
        assert_eq!(store.resolve_external("apify-1").as_deref(), Some(second.as_str()));

        // The new owner is live again, so the id is held once more.
        assert!(store.link_external(&other, "apify-1").is_err());
        store
            .update(&second, |r| {
                r.run.state = RunState::Cancelled;
                Ok(Edit::Commit(()))
            })
            .unwrap();
        store.link_external(&other, "apify-1").unwrap();
        assert_eq!(store.resolve_external("apify-1").as_deref(), Some(other.as_str()));
    }

    #[test]
    fn test_active_summaries_skip_idle_runs() {
        let store = RunStore::in_memory();
        let queued = store.insert_if_no_active(record("c1", "e1")).unwrap().run.id;
        let paused = store.insert_if_no_active(record("c2", "e1")).unwrap().run.id;
        let done = store.insert_if_no_active(record("c3", "e1")).unwrap().run.id;
        for (id, state) in [(&paused, RunState::Paused), (&done, RunState::Completed)] {
            store
                .update(id, |r| {
                    r.run.state = state;
                    Ok(Edit::Commit(()))
                })
                .unwrap();
        }
        let now = Utc::now();
        store
            .update(&queued, |r| {
                let lead = r.pool.claim_next().unwrap();
                r.claim = Some(Claim::new(&lead.email, now));
                Ok(Edit::Commit(()))
            })
            .unwrap();

        let summaries = store.active_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].run_id, queued);
        let claim = summaries[0].claim.as_ref().unwrap();
        assert!(!claim.is_expired(now, chrono::Duration::minutes(10)));
        assert!(claim.is_expired(now + chrono::Duration::minutes(10), chrono::Duration::minutes(10)));
    }

    #[test]
    fn test_restore_releases_claims() {
        let db = Arc::new(SchedulerDb::in_memory().unwrap());
        let store = RunStore::persistent(db.clone());
        let mut rec = record("c1", "e1");
        rec.run.external_run_id = Some("ext-9".into());
        let id = store.insert_if_no_active(rec).unwrap().run.id;
        store
            .update(&id, |r| {
                let lead = r.pool.claim_next().unwrap();
                r.claim = Some(Claim::new(&lead.email, Utc::now()));
                Ok(Edit::Commit(()))
            })
            .unwrap();

        let restored = RunStore::persistent(db);
        assert_eq!(restored.restore().unwrap(), 1);
        let rec = restored.get(&id).unwrap();
        assert!(rec.claim.is_none());
        assert_eq!(rec.pool.stats().pending, 1);
        assert_eq!(restored.resolve_external("ext-9").as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_status_view() {
        let store = RunStore::in_memory();
        let id = store.insert_if_no_active(record("c1", "e1")).unwrap().run.id;
        let status = store.status(&id, Utc::now()).unwrap();
        assert_eq!(status.pool.total, 1);
        assert_eq!(status.verdict, CapacityVerdict::Allowed);
        assert!(!status.dispatch_in_flight);
        assert!(store.status("nope", Utc::now()).is_none());
    }
}
