//! Reply approval: a human-approved draft is sent at most once.
//!
//! Approval claims the draft (`awaiting_approval → sending`) under the draft
//! map lock, dispatches outside it, then settles to `sent`, or back to
//! `awaiting_approval` when the provider fails. Dispatch and settle run in a
//! spawned task, so an approval request that goes away mid-send still
//! settles; a draft stuck in `sending` past the lease may be approved again.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::error::{CadenceError, Result};
use cadence_core::lead::LeadRecord;
use cadence_core::traits::SendProvider;
use cadence_core::types::{DraftState, MessageContent, ReplyDraft, SendReceipt};

use crate::persistence::{SchedulerDb, SendLogEntry, SendSubject};

/// Upstream-generated reply submitted for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSubmission {
    #[serde(alias = "brandId")]
    pub brand_id: String,
    #[serde(alias = "threadId")]
    pub thread_id: String,
    pub recipient: LeadRecord,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalReceipt {
    pub draft_id: String,
    pub receipt: SendReceipt,
}

const SENDING_LEASE_MINUTES: i64 = 10;

pub struct DraftStore {
    drafts: RwLock<HashMap<String, ReplyDraft>>,
    db: Option<Arc<SchedulerDb>>,
    sending_lease: Duration,
}

impl DraftStore {
    pub fn in_memory() -> Self {
        Self {
            drafts: RwLock::new(HashMap::new()),
            db: None,
            sending_lease: Duration::minutes(SENDING_LEASE_MINUTES),
        }
    }

    /// How long a draft may stay in `sending` before another approval may
    /// take it over.
    pub fn with_sending_lease(mut self, lease: Duration) -> Self {
        self.sending_lease = lease;
        self
    }

    /// Store backed by `db`, loaded with what it holds. A draft left in
    /// `sending` by a stopped process goes back to awaiting approval.
    pub fn persistent(db: Arc<SchedulerDb>) -> Result<Self> {
        let mut drafts = HashMap::new();
        for mut draft in db.load_drafts()? {
            if draft.state == DraftState::Sending {
                tracing::warn!("Draft {}: approval interrupted, back to awaiting approval", draft.id);
                draft.state = DraftState::AwaitingApproval;
                draft.sending_since = None;
                db.save_draft(&draft)?;
            }
            drafts.insert(draft.id.clone(), draft);
        }
        Ok(Self {
            drafts: RwLock::new(drafts),
            db: Some(db),
            sending_lease: Duration::minutes(SENDING_LEASE_MINUTES),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ReplyDraft>> {
        self.drafts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ReplyDraft>> {
        self.drafts.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, draft: &ReplyDraft) {
        if let Some(db) = &self.db
            && let Err(e) = db.save_draft(draft)
        {
            tracing::warn!("⚠️ Failed to persist draft {}: {e}", draft.id);
        }
    }

    pub fn submit(&self, submission: DraftSubmission) -> Result<ReplyDraft> {
        if submission.brand_id.trim().is_empty() || submission.thread_id.trim().is_empty() {
            return Err(CadenceError::Validation("brand_id and thread_id are required".into()));
        }
        if submission.body.trim().is_empty() {
            return Err(CadenceError::Validation("draft body is empty".into()));
        }
        let recipient = submission
            .recipient
            .normalize(None)
            .ok_or_else(|| CadenceError::Validation("recipient email is not usable".into()))?;

        let draft = ReplyDraft::new(
            &submission.brand_id,
            &submission.thread_id,
            recipient,
            MessageContent {
                subject: submission.subject,
                body: submission.body,
            },
        );
        self.write().insert(draft.id.clone(), draft.clone());
        self.persist(&draft);
        tracing::info!("📝 Draft {} submitted for thread {}", draft.id, draft.thread_id);
        Ok(draft)
    }

    pub fn get(&self, draft_id: &str) -> Option<ReplyDraft> {
        self.read().get(draft_id).cloned()
    }

    /// Drafts of a brand, optionally filtered by state, oldest first.
    pub fn list(&self, brand_id: Option<&str>, state: Option<DraftState>) -> Vec<ReplyDraft> {
        let mut drafts: Vec<ReplyDraft> = self
            .read()
            .values()
            .filter(|d| brand_id.is_none_or(|b| d.brand_id == b))
            .filter(|d| state.is_none_or(|s| d.state == s))
            .cloned()
            .collect();
        drafts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        drafts
    }

    fn claim(&self, draft_id: &str, now: DateTime<Utc>) -> Result<ReplyDraft> {
        let mut drafts = self.write();
        let draft = drafts
            .get_mut(draft_id)
            .ok_or_else(|| CadenceError::not_found("draft", draft_id))?;
        match draft.state {
            DraftState::Sent => {
                return Err(CadenceError::AlreadySent {
                    draft_id: draft_id.to_string(),
                });
            }
            DraftState::Sending => {
                let expired = draft
                    .sending_since
                    .is_none_or(|since| now - since >= self.sending_lease);
                if !expired {
                    return Err(CadenceError::ApprovalInProgress {
                        draft_id: draft_id.to_string(),
                    });
                }
                tracing::warn!("⚠️ Draft {draft_id}: previous approval never settled, taking over");
            }
            DraftState::AwaitingApproval => {}
        }
        draft.state = DraftState::Sending;
        draft.sending_since = Some(now);
        let claimed = draft.clone();
        drop(drafts);
        self.persist(&claimed);
        Ok(claimed)
    }

    fn settle(&self, draft_id: &str, outcome: &Result<SendReceipt>) {
        let settled = {
            let mut drafts = self.write();
            let Some(draft) = drafts.get_mut(draft_id) else {
                return;
            };
            draft.sending_since = None;
            match outcome {
                Ok(receipt) => {
                    draft.state = DraftState::Sent;
                    draft.sent_at = Some(receipt.accepted_at);
                    draft.last_error = None;
                }
                Err(e) => {
                    draft.state = DraftState::AwaitingApproval;
                    draft.last_error = Some(e.to_string());
                }
            }
            draft.clone()
        };
        self.persist(&settled);
    }
}

pub struct ReplyApprover {
    drafts: Arc<DraftStore>,
    provider: Arc<dyn SendProvider>,
    db: Option<Arc<SchedulerDb>>,
}

impl ReplyApprover {
    pub fn new(drafts: Arc<DraftStore>, provider: Arc<dyn SendProvider>) -> Self {
        Self {
            drafts,
            provider,
            db: None,
        }
    }

    pub fn with_send_log(mut self, db: Arc<SchedulerDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn drafts(&self) -> &Arc<DraftStore> {
        &self.drafts
    }

    /// Send an approved draft through the provider, at most once.
    pub async fn approve_and_send(&self, draft_id: &str) -> Result<ApprovalReceipt> {
        let draft = self.drafts.claim(draft_id, Utc::now())?;
        let drafts = self.drafts.clone();
        let provider = self.provider.clone();
        let db = self.db.clone();
        let task = tokio::spawn(async move { send_claimed(drafts, provider, db, draft).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("approval task died: {e}");
                self.drafts
                    .settle(draft_id, &Err(CadenceError::provider(message.clone(), true)));
                Err(CadenceError::provider(message, true))
            }
        }
    }
}

async fn send_claimed(
    drafts: Arc<DraftStore>,
    provider: Arc<dyn SendProvider>,
    db: Option<Arc<SchedulerDb>>,
    draft: ReplyDraft,
) -> Result<ApprovalReceipt> {
    let outcome = provider.dispatch_send(&draft.recipient, &draft.content).await;

    if let Some(db) = &db {
        let entry = match &outcome {
            Ok(receipt) => {
                SendLogEntry::sent(SendSubject::Draft, &draft.id, &draft.recipient.email, receipt)
            }
            Err(e) => SendLogEntry::failed(
                SendSubject::Draft,
                &draft.id,
                &draft.recipient.email,
                provider.name(),
                e,
            ),
        };
        db.log_send(&entry);
    }
    drafts.settle(&draft.id, &outcome);

    match outcome {
        Ok(receipt) => {
            tracing::info!(
                "📤 Draft {} sent to {} at {}",
                draft.id,
                draft.recipient.email,
                Utc::now().format("%H:%M:%S")
            );
            Ok(ApprovalReceipt {
                draft_id: draft.id,
                receipt,
            })
        }
        Err(e) => {
            tracing::warn!("⚠️ Draft {}: send failed, left awaiting approval: {e}", draft.id);
            Err(e)
        }
    }
}
