//! Run state machine.
//!
//! ```text
//! queued  ──start──▶ running ──complete──▶ completed
//!                    │  ▲   └──fail──────▶ failed
//!               pause│  │resume
//!                    ▼  │
//!                   paused
//! queued | running | paused ──cancel──▶ cancelled
//! ```
//!
//! Operators drive pause/resume/cancel; the tick drives start/complete/fail.
//! Any transition out of a terminal state is rejected and leaves the run as is.

use chrono::Utc;

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{ControlAction, Run, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
}

impl RunTransition {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
        }
    }

    /// Operator-initiated edges (exposed by run control).
    pub fn is_operator(&self) -> bool {
        matches!(self, Self::Pause | Self::Resume | Self::Cancel)
    }
}

impl From<ControlAction> for RunTransition {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Pause => Self::Pause,
            ControlAction::Resume => Self::Resume,
            ControlAction::Cancel => Self::Cancel,
        }
    }
}

/// Resolve the target state of `transition` from `from`.
pub fn next_state(from: RunState, transition: RunTransition) -> Result<RunState> {
    use RunState::*;
    use RunTransition::*;

    let to = match (from, transition) {
        (Queued, Start) => Running,
        (Running, Pause) => Paused,
        (Paused, Resume) => Running,
        (Running, Complete) => Completed,
        (Running, Fail) => Failed,
        (Queued | Running | Paused, Cancel) => Cancelled,
        _ => {
            return Err(CadenceError::IllegalTransition {
                from,
                action: transition.action(),
            });
        }
    };
    Ok(to)
}

/// Apply a transition to a run in place. On error the run is untouched.
pub fn apply(run: &mut Run, transition: RunTransition) -> Result<RunState> {
    let from = run.state;
    let to = next_state(from, transition)?;
    run.state = to;
    run.updated_at = Utc::now();
    tracing::info!("Run {} {} → {} ({})", run.id, from, to, transition.action());
    Ok(to)
}
