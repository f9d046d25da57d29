//! # Cadence Trigger
//!
//! Calls the tick entry point on behalf of a periodic clock, an operator, or
//! a read path that wants to nudge the scheduler along.
//!
//! ```text
//! spawn_periodic ─┐
//! invoke_manual ──┼─▶ TickInvoker ──retry/backoff──▶ TickTarget
//! Nudger ─────────┘                                  ├── HttpTickTarget  (POST /api/v1/scheduler/tick)
//!                                                    └── LocalTickTarget (TickScheduler in-process)
//! ```

pub mod invoker;
pub mod periodic;
pub mod target;

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::TriggerConfig;
use cadence_scheduler::TickScheduler;

pub use invoker::{
    InvocationResult, InvocationSource, RetryPolicy, TickInvoker, bearer_matches,
    secret_matches,
};
pub use periodic::{Nudger, spawn_periodic};
pub use target::{AttemptFailure, HttpTickTarget, LocalTickTarget, TickTarget};

/// Invoker that reaches the tick over HTTP; without an endpoint it reports
/// `configuration_missing` on every call.
pub fn http_invoker(config: &TriggerConfig, max_runs: u32) -> TickInvoker {
    let target = config
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|endpoint| {
            Arc::new(HttpTickTarget::new(
                endpoint,
                config.secret.clone(),
                config.request_timeout_secs,
            )) as Arc<dyn TickTarget>
        });
    TickInvoker::new(target, max_runs)
        .with_policy(RetryPolicy::from_config(config))
        .with_secret(config.secret.clone())
}

/// Invoker bound to a scheduler in this process.
pub fn local_invoker(config: &TriggerConfig, scheduler: Arc<TickScheduler>, max_runs: u32) -> TickInvoker {
    TickInvoker::new(Some(Arc::new(LocalTickTarget::new(scheduler))), max_runs)
        .with_policy(RetryPolicy::from_config(config))
        .with_secret(config.secret.clone())
}

pub fn nudger(config: &TriggerConfig, invoker: Arc<TickInvoker>) -> Arc<Nudger> {
    Arc::new(Nudger::new(
        invoker,
        Duration::from_secs(config.nudge_min_interval_secs),
    ))
}
