//! Periodic trigger loop and the read-path nudger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::invoker::{InvocationSource, TickInvoker};

/// Invoke the tick every `interval_secs`. Failed invocations are logged and
/// the loop keeps going.
pub fn spawn_periodic(invoker: Arc<TickInvoker>, interval_secs: u64) -> JoinHandle<()> {
    let period = Duration::from_secs(interval_secs.max(1));
    tracing::info!("⏰ Periodic trigger started (every {}s)", period.as_secs());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let result = invoker.invoke(InvocationSource::Periodic).await;
            if result.ok {
                tracing::debug!(
                    "Periodic tick ok in {}ms ({} attempt(s))",
                    result.elapsed_ms,
                    result.attempt_count
                );
            } else {
                tracing::warn!(
                    "⚠️ Periodic tick failed: {} ({} attempt(s), {}ms)",
                    result.error.as_deref().unwrap_or("unknown error"),
                    result.attempt_count,
                    result.elapsed_ms
                );
            }
        }
    })
}

/// Low-priority tick fired from read paths so runs do not look stalled
/// between periodic ticks. At most one nudge is in flight, nudges closer
/// together than `min_interval` are dropped, and failures are swallowed.
pub struct Nudger {
    invoker: Arc<TickInvoker>,
    min_interval: Duration,
    in_flight: AtomicBool,
    last_started: Mutex<Option<Instant>>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Nudger {
    pub fn new(invoker: Arc<TickInvoker>, min_interval: Duration) -> Self {
        Self {
            invoker,
            min_interval,
            in_flight: AtomicBool::new(false),
            last_started: Mutex::new(None),
        }
    }

    /// Returns whether a nudge was actually started.
    pub fn nudge(self: &Arc<Self>) -> bool {
        {
            let mut last = self
                .last_started
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(at) = *last
                && at.elapsed() < self.min_interval
            {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            *last = Some(Instant::now());
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = InFlight(&this.in_flight);
            let result = this.invoker.invoke(InvocationSource::Nudge).await;
            if !result.ok {
                tracing::debug!(
                    "Nudge tick failed (ignored): {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        });
        true
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}
