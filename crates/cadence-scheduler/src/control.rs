//! Operator control of runs: pause, resume, cancel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{ControlAction, RunState};

use crate::state;
use crate::store::{Edit, RunStore};

const MAX_CAS_ATTEMPTS: usize = 3;

/// The brand (and optionally experiment) a caller acts for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlScope {
    #[serde(alias = "brandId")]
    pub brand_id: String,
    #[serde(default, alias = "experimentId")]
    pub experiment_id: Option<String>,
}

impl ControlScope {
    pub fn brand(brand_id: &str) -> Self {
        Self {
            brand_id: brand_id.to_string(),
            experiment_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlOutcome {
    pub run_id: String,
    pub action: ControlAction,
    pub from: RunState,
    pub to: RunState,
}

pub struct RunControl {
    store: Arc<RunStore>,
}

impl RunControl {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    /// Apply an operator action. Runs outside the caller's scope are reported
    /// as not found; state-machine rejections come back unchanged.
    pub fn control(
        &self,
        scope: &ControlScope,
        run_id: &str,
        action: ControlAction,
        reason: Option<String>,
    ) -> Result<ControlOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self
                .store
                .get(run_id)
                .filter(|r| r.run.brand_id == scope.brand_id)
                .filter(|r| {
                    scope
                        .experiment_id
                        .as_deref()
                        .is_none_or(|exp| r.run.experiment_id == exp)
                })
                .ok_or_else(|| CadenceError::not_found("run", run_id))?;

            let from = record.run.state;
            let reason = reason.clone();
            let result = self.store.compare_and_swap(run_id, record.version, |rec| {
                let to = state::apply(&mut rec.run, action.into())?;
                rec.run.state_reason = reason;
                Ok(Edit::Commit(to))
            });

            match result {
                Ok(to) => {
                    tracing::info!("Run {run_id}: operator {} ({from} → {to})", action.as_str());
                    return Ok(ControlOutcome {
                        run_id: run_id.to_string(),
                        action,
                        from,
                        to,
                    });
                }
                Err(CadenceError::Conflict { .. }) => {
                    tracing::debug!("Run {run_id}: version moved during {}, retrying", action.as_str());
                }
                Err(e) => return Err(e),
            }
        }
        Err(CadenceError::Conflict {
            run_id: run_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::LeadPool;
    use crate::store::RunRecord;
    use cadence_core::types::{OwnerType, RateLimits, Run, RunOwner, TriggerOrigin};

    fn setup(state: RunState) -> (Arc<RunStore>, RunControl, String) {
        let store = Arc::new(RunStore::in_memory());
        let mut run = Run::new(
            "brand-1",
            "camp-1",
            "exp-1",
            RunOwner {
                owner_type: OwnerType::Experiment,
                owner_id: "exp-1".into(),
            },
            TriggerOrigin::Manual,
            RateLimits::default(),
        );
        run.state = state;
        let id = run.id.clone();
        store.insert_if_no_active(RunRecord::new(run, LeadPool::new())).unwrap();
        (store.clone(), RunControl::new(store), id)
    }

    #[test]
    fn test_pause_resume_cancel() {
        let (store, control, id) = setup(RunState::Running);
        let scope = ControlScope::brand("brand-1");

        let out = control
            .control(&scope, &id, ControlAction::Pause, Some("holiday".into()))
            .unwrap();
        assert_eq!((out.from, out.to), (RunState::Running, RunState::Paused));
        assert_eq!(store.get(&id).unwrap().run.state_reason.as_deref(), Some("holiday"));

        control.control(&scope, &id, ControlAction::Resume, None).unwrap();
        let out = control.control(&scope, &id, ControlAction::Cancel, None).unwrap();
        assert_eq!(out.to, RunState::Cancelled);
    }

    #[test]
    fn test_terminal_runs_reject_every_action() {
        for state in [RunState::Completed, RunState::Cancelled, RunState::Failed] {
            let (store, control, id) = setup(state);
            let before = store.get(&id).unwrap();
            for action in [ControlAction::Pause, ControlAction::Resume, ControlAction::Cancel] {
                let err = control
                    .control(&ControlScope::brand("brand-1"), &id, action, None)
                    .unwrap_err();
                assert_eq!(err.reason(), "illegal_transition");
            }
            let after = store.get(&id).unwrap();
            assert_eq!(after.run.state, state);
            assert_eq!(after.version, before.version);
        }
    }

    #[test]
    fn test_illegal_action_reports_state_machine_reason() {
        let (_, control, id) = setup(RunState::Queued);
        let err = control
            .control(&ControlScope::brand("brand-1"), &id, ControlAction::Resume, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Illegal transition: cannot resume a run that is queued");
    }

    #[test]
    fn test_scope_is_enforced() {
        let (store, control, id) = setup(RunState::Running);
        let err = control
            .control(&ControlScope::brand("brand-2"), &id, ControlAction::Pause, None)
            .unwrap_err();
        assert_eq!(err.reason(), "run_not_found");

        let wrong_experiment = ControlScope {
            brand_id: "brand-1".into(),
            experiment_id: Some("exp-2".into()),
        };
        assert!(control.control(&wrong_experiment, &id, ControlAction::Pause, None).is_err());
        assert_eq!(store.get(&id).unwrap().run.state, RunState::Running);

        let right_experiment = ControlScope {
            brand_id: "brand-1".into(),
            experiment_id: Some("exp-1".into()),
        };
        control.control(&right_experiment, &id, ControlAction::Pause, None).unwrap();
    }

    #[test]
    fn test_racing_pause_and_cancel() {
        let (store, control, id) = setup(RunState::Running);
        let control = Arc::new(control);
        let handles: Vec<_> = [ControlAction::Pause, ControlAction::Cancel]
            .into_iter()
            .map(|action| {
                let control = control.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    control.control(&ControlScope::brand("brand-1"), &id, action, None)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Cancel is legal from both running and paused, so it lands in either
        // order; a pause arriving after it is rejected, never applied.
        assert!(results[1].is_ok());
        assert_eq!(store.get(&id).unwrap().run.state, RunState::Cancelled);
        if let Err(e) = &results[0] {
            assert_eq!(e.reason(), "illegal_transition");
        }
    }
}
