//! # Cadence Scheduler
//!
//! Run orchestration: launches runs of an experiment against a lead pool and
//! advances them one paced send at a time.
//!
//! ## Architecture
//! ```text
//! Invocation trigger (periodic / manual / nudge)
//!   └── TickScheduler::tick(max_runs)
//!         ├── RunStore       per-run locked records, versioned
//!         ├── capacity       daily / hourly caps + spacing, run timezone
//!         ├── SendProvider   dispatch (outside any lock, claim held)
//!         └── state          queued → running → completed | failed
//!
//! RunLauncher    validate against the directory, snapshot limits, seed pool
//! RunControl     operator pause / resume / cancel (compare-and-swap)
//! LeadIngestor   idempotent enrichment merges keyed by external run id
//! ReplyApprover  at-most-once send of approved reply drafts
//! SchedulerDb    SQLite persistence + send/audit log
//! ```

pub mod approval;
pub mod capacity;
pub mod control;
pub mod engine;
pub mod ingest;
pub mod launcher;
pub mod persistence;
pub mod pool;
pub mod state;
pub mod store;

pub use approval::{ApprovalReceipt, DraftStore, DraftSubmission, ReplyApprover};
pub use capacity::CapacityVerdict;
pub use control::{ControlOutcome, ControlScope, RunControl};
pub use engine::{TickError, TickReport, TickScheduler};
pub use ingest::{IngestOutcome, IngestReport, LeadIngestor};
pub use launcher::{LaunchReceipt, LaunchRequest, RunLauncher};
pub use persistence::{SchedulerDb, SendLogEntry, SendOutcome, SendSubject};
pub use pool::{LeadPool, LeadStatus, PoolStats};
pub use state::RunTransition;
pub use store::{RunRecord, RunStatus, RunStore, RunSummary};
