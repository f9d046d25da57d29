//! Per-run lead pool: insertion-ordered, deduplicated by normalized email.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::lead::Lead;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Not sent yet.
    Pending,
    /// Claimed by an in-flight dispatch.
    Claimed,
    Contacted,
    /// Terminal provider failure; never retried.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub lead: Lead,
    pub status: LeadStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub contacted_at: Option<DateTime<Utc>>,
}

/// Result of merging one lead into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub pending: usize,
    pub claimed: usize,
    pub contacted: usize,
    pub failed: usize,
}

/// Leads of one run. Serialized as the plain entry list; the email index is
/// rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<PoolEntry>", into = "Vec<PoolEntry>")]
pub struct LeadPool {
    entries: Vec<PoolEntry>,
    index: HashMap<String, usize>,
}

impl From<Vec<PoolEntry>> for LeadPool {
    fn from(entries: Vec<PoolEntry>) -> Self {
        let mut pool = Self::default();
        for entry in entries {
            if let Some(&pos) = pool.index.get(&entry.lead.email) {
                pool.entries[pos] = entry;
            } else {
                pool.index.insert(entry.lead.email.clone(), pool.entries.len());
                pool.entries.push(entry);
            }
        }
        pool
    }
}

impl From<LeadPool> for Vec<PoolEntry> {
    fn from(pool: LeadPool) -> Self {
        pool.entries
    }
}

impl LeadPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(leads: impl IntoIterator<Item = Lead>) -> Self {
        let mut pool = Self::new();
        for lead in leads {
            pool.merge(lead);
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, email: &str) -> Option<&PoolEntry> {
        self.index.get(email).map(|&pos| &self.entries[pos])
    }

    /// Insert a new lead or refresh attributes of an existing one.
    /// Send status is never touched by a merge.
    pub fn merge(&mut self, lead: Lead) -> MergeEffect {
        match self.index.get(&lead.email) {
            Some(&pos) => {
                if self.entries[pos].lead.merge_from(&lead) {
                    MergeEffect::Updated
                } else {
                    MergeEffect::Unchanged
                }
            }
            None => {
                self.index.insert(lead.email.clone(), self.entries.len());
                self.entries.push(PoolEntry {
                    lead,
                    status: LeadStatus::Pending,
                    attempts: 0,
                    contacted_at: None,
                });
                MergeEffect::Inserted
            }
        }
    }

    /// Claim the oldest pending lead.
    pub fn claim_next(&mut self) -> Option<Lead> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.status == LeadStatus::Pending)?;
        entry.status = LeadStatus::Claimed;
        entry.attempts += 1;
        Some(entry.lead.clone())
    }

    fn set_status(&mut self, email: &str, from: LeadStatus, to: LeadStatus) -> bool {
        match self.index.get(email) {
            Some(&pos) if self.entries[pos].status == from => {
                self.entries[pos].status = to;
                true
            }
            _ => false,
        }
    }

    pub fn mark_contacted(&mut self, email: &str, at: DateTime<Utc>) -> bool {
        let changed = self.set_status(email, LeadStatus::Claimed, LeadStatus::Contacted);
        if changed && let Some(&pos) = self.index.get(email) {
            self.entries[pos].contacted_at = Some(at);
        }
        changed
    }

    /// Put a claimed lead back so a later tick retries it.
    pub fn release(&mut self, email: &str) -> bool {
        self.set_status(email, LeadStatus::Claimed, LeadStatus::Pending)
    }

    pub fn mark_failed(&mut self, email: &str) -> bool {
        self.set_status(email, LeadStatus::Claimed, LeadStatus::Failed)
    }

    /// Release every claim (used after a restart, when no dispatch can be in flight).
    pub fn release_all_claims(&mut self) -> usize {
        let mut released = 0;
        for entry in &mut self.entries {
            if entry.status == LeadStatus::Claimed {
                entry.status = LeadStatus::Pending;
                released += 1;
            }
        }
        released
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.status == LeadStatus::Pending)
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.entries.len(),
            ..PoolStats::default()
        };
        for e in &self.entries {
            match e.status {
                LeadStatus::Pending => stats.pending += 1,
                LeadStatus::Claimed => stats.claimed += 1,
                LeadStatus::Contacted => stats.contacted += 1,
                LeadStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(email: &str) -> Lead {
        Lead::from_email(email).unwrap()
    }

    #[test]
    fn test_merge_dedups_by_email() {
        let mut pool = LeadPool::new();
        assert_eq!(pool.merge(lead("a@acme.io")), MergeEffect::Inserted);
        assert_eq!(pool.merge(lead("b@acme.io")), MergeEffect::Inserted);
        assert_eq!(pool.merge(lead("a@acme.io")), MergeEffect::Unchanged);
        let mut renamed = lead("a@acme.io");
        renamed.name = Some("Ann".into());
        assert_eq!(pool.merge(renamed), MergeEffect::Updated);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get("a@acme.io").unwrap().lead.name.as_deref(), Some("Ann"));
    }

    #[test]
    fn test_claim_in_insertion_order() {
        let mut pool = LeadPool::seeded([lead("a@acme.io"), lead("b@acme.io")]);
        assert_eq!(pool.claim_next().unwrap().email, "a@acme.io");
        assert_eq!(pool.claim_next().unwrap().email, "b@acme.io");
        assert!(pool.claim_next().is_none());
    }

    #[test]
    fn test_release_and_fail() {
        let mut pool = LeadPool::seeded([lead("a@acme.io"), lead("b@acme.io")]);
        let first = pool.claim_next().unwrap();
        assert!(pool.release(&first.email));
        // Released lead is retried before later ones.
        assert_eq!(pool.claim_next().unwrap().email, "a@acme.io");
        assert!(pool.mark_failed("a@acme.io"));
        assert!(!pool.release("a@acme.io"));
        assert_eq!(pool.get("a@acme.io").unwrap().attempts, 2);
        let stats = pool.stats();
        assert_eq!((stats.pending, stats.failed), (1, 1));
    }

    #[test]
    fn test_merge_keeps_send_status() {
        let mut pool = LeadPool::seeded([lead("a@acme.io")]);
        pool.claim_next();
        assert!(pool.mark_contacted("a@acme.io", Utc::now()));
        pool.merge(lead("a@acme.io"));
        assert_eq!(pool.get("a@acme.io").unwrap().status, LeadStatus::Contacted);
        assert!(!pool.has_pending());
    }

    #[test]
    fn test_serde_rebuilds_index() {
        let mut pool = LeadPool::seeded([lead("a@acme.io"), lead("b@acme.io")]);
        pool.claim_next();
        let json = serde_json::to_string(&pool).unwrap();
        let mut back: LeadPool = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get("a@acme.io").unwrap().status, LeadStatus::Claimed);
        assert_eq!(back.release_all_claims(), 1);
        assert_eq!(back.merge(lead("b@acme.io")), MergeEffect::Unchanged);
    }
}
