//! SQLite-backed persistence for runs, reply drafts, and the send log.
//! Survives restarts; the in-memory arena stays the source of truth while the
//! process is up and writes through here.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{ReplyDraft, SendReceipt};

use crate::store::RunRecord;

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Failed,
}

impl SendOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// What a send-log entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendSubject {
    Run,
    Draft,
}

impl SendSubject {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Draft => "draft",
        }
    }
}

/// One row of the send/audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLogEntry {
    #[serde(default)]
    pub id: Option<i64>,
    pub subject: SendSubject,
    pub subject_id: String,
    pub lead_email: String,
    pub outcome: SendOutcome,
    pub retryable: bool,
    pub provider: String,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SendLogEntry {
    pub fn sent(subject: SendSubject, subject_id: &str, lead_email: &str, receipt: &SendReceipt) -> Self {
        Self {
            id: None,
            subject,
            subject_id: subject_id.to_string(),
            lead_email: lead_email.to_string(),
            outcome: SendOutcome::Sent,
            retryable: false,
            provider: receipt.provider.clone(),
            message_id: receipt.message_id.clone(),
            error: None,
            created_at: receipt.accepted_at,
        }
    }

    pub fn failed(
        subject: SendSubject,
        subject_id: &str,
        lead_email: &str,
        provider: &str,
        error: &CadenceError,
    ) -> Self {
        Self {
            id: None,
            subject,
            subject_id: subject_id.to_string(),
            lead_email: lead_email.to_string(),
            outcome: SendOutcome::Failed,
            retryable: error.is_retryable(),
            provider: provider.to_string(),
            message_id: None,
            error: Some(error.to_string()),
            created_at: Utc::now(),
        }
    }
}

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            -- Run records (JSON snapshot; version guards against stale writes)
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                brand_id TEXT NOT NULL,
                state TEXT NOT NULL,
                version INTEGER NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Reply drafts awaiting approval
            CREATE TABLE IF NOT EXISTS reply_drafts (
                id TEXT PRIMARY KEY,
                brand_id TEXT NOT NULL,
                state TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Send / audit log
            CREATE TABLE IF NOT EXISTS send_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject TEXT NOT NULL,           -- 'run' or 'draft'
                subject_id TEXT NOT NULL,
                lead_email TEXT NOT NULL,
                outcome TEXT NOT NULL,           -- 'sent' or 'failed'
                retryable INTEGER NOT NULL DEFAULT 0,
                provider TEXT NOT NULL,
                message_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_send_log_subject ON send_log(subject_id);
         ",
            )
            .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    // ─── Runs ──────────────────────────────────────────────

    /// Upsert a run record. Lands only when `record.version` is newer than the
    /// stored one, so out-of-order writers cannot roll a run back.
    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn()
            .execute(
                "INSERT INTO runs (id, brand_id, state, version, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    version = excluded.version,
                    record = excluded.record,
                    updated_at = excluded.updated_at
                 WHERE excluded.version > runs.version",
                params![
                    record.run.id,
                    record.run.brand_id,
                    record.run.state.as_str(),
                    record.version as i64,
                    json,
                    record.run.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| db_err("Save run", e))?;
        Ok(())
    }

    /// Load all run records.
    pub fn load_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, record FROM runs ORDER BY id")
            .map_err(|e| db_err("Load runs", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| db_err("Load runs", e))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, json) = row.map_err(|e| db_err("Load runs", e))?;
            match serde_json::from_str::<RunRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable run record {id}: {e}"),
            }
        }
        Ok(records)
    }

    pub fn stored_run_version(&self, id: &str) -> Result<Option<u64>> {
        self.conn()
            .query_row("SELECT version FROM runs WHERE id = ?1", [id], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map(|v| v.map(|v| v as u64))
            .map_err(|e| db_err("Run version", e))
    }

    // ─── Reply drafts ──────────────────────────────────────

    pub fn save_draft(&self, draft: &ReplyDraft) -> Result<()> {
        let json = serde_json::to_string(draft)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO reply_drafts (id, brand_id, state, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    draft.id,
                    draft.brand_id,
                    draft.state.as_str(),
                    json,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| db_err("Save draft", e))?;
        Ok(())
    }

    pub fn load_drafts(&self) -> Result<Vec<ReplyDraft>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT record FROM reply_drafts ORDER BY id")
            .map_err(|e| db_err("Load drafts", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("Load drafts", e))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect())
    }

    // ─── Send log ──────────────────────────────────────────

    /// Append a send-log entry, returning its row id.
    pub fn record_send(&self, entry: &SendLogEntry) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO send_log
             (subject, subject_id, lead_email, outcome, retryable, provider, message_id, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.subject.as_str(),
                entry.subject_id,
                entry.lead_email,
                entry.outcome.as_str(),
                entry.retryable as i32,
                entry.provider,
                entry.message_id,
                entry.error,
                entry.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Record send", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent entries first.
    pub fn recent_sends(&self, limit: usize) -> Result<Vec<SendLogEntry>> {
        self.query_sends(
            "SELECT id, subject, subject_id, lead_email, outcome, retryable, provider, message_id, error, created_at
             FROM send_log ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Entries for one run or draft, oldest first.
    pub fn sends_for(&self, subject_id: &str) -> Result<Vec<SendLogEntry>> {
        self.query_sends(
            "SELECT id, subject, subject_id, lead_email, outcome, retryable, provider, message_id, error, created_at
             FROM send_log WHERE subject_id = ?1 ORDER BY id",
            params![subject_id],
        )
    }

    /// Append to the log; failures are logged, never returned.
    pub fn log_send(&self, entry: &SendLogEntry) {
        if let Err(e) = self.record_send(entry) {
            tracing::warn!("⚠️ Failed to record send for {}: {e}", entry.subject_id);
        }
    }

    fn query_sends(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<SendLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(|e| db_err("Query sends", e))?;
        let rows = stmt
            .query_map(args, |row| {
                let subject: String = row.get(1)?;
                let outcome: String = row.get(4)?;
                let created_at: String = row.get(9)?;
                Ok(SendLogEntry {
                    id: Some(row.get(0)?),
                    subject: if subject == "draft" {
                        SendSubject::Draft
                    } else {
                        SendSubject::Run
                    },
                    subject_id: row.get(2)?,
                    lead_email: row.get(3)?,
                    outcome: if outcome == "sent" {
                        SendOutcome::Sent
                    } else {
                        SendOutcome::Failed
                    },
                    retryable: row.get::<_, i32>(5)? != 0,
                    provider: row.get(6)?,
                    message_id: row.get(7)?,
                    error: row.get(8)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| db_err("Query sends", e))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn db_err(context: &str, e: rusqlite::Error) -> CadenceError {
    CadenceError::Database(format!("{context}: {e}"))
}
