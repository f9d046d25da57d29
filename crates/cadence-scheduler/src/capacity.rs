//! Capacity policy: pure rate-limit verdicts for a run.
//!
//! Counters are kept per local window (run timezone): a daily counter belongs
//! to a local date and an hourly counter to a local date+hour. A counter whose
//! window is not the current one reads as zero, so rollover happens at local
//! midnight / local hour boundaries without any timer.
//!
//! DST: on a fall-back transition the repeated local hour maps to a single
//! window, so both occurrences share one hourly budget. Spring-forward simply
//! skips a window.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use cadence_core::types::{PacingCounters, RateLimits};

/// Verdict for "may this run send right now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityVerdict {
    Allowed,
    BlockedDailyCap,
    BlockedHourlyCap,
    BlockedSpacing,
}

impl CapacityVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::BlockedDailyCap => "blocked_daily_cap",
            Self::BlockedHourlyCap => "blocked_hourly_cap",
            Self::BlockedSpacing => "blocked_spacing",
        }
    }
}

/// Local day and hour an instant falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalWindow {
    pub day: NaiveDate,
    pub hour: NaiveDateTime,
}

impl LocalWindow {
    pub fn at(tz: Tz, now: DateTime<Utc>) -> Self {
        let local = now.with_timezone(&tz).naive_local();
        let hour = NaiveTime::from_hms_opt(local.hour(), 0, 0)
            .map(|t| local.date().and_time(t))
            .unwrap_or(local);
        Self {
            day: local.date(),
            hour,
        }
    }
}

fn timezone(limits: &RateLimits) -> Tz {
    // Validated at launch; only a hand-edited record can get here unparsed.
    limits.tz().unwrap_or(Tz::UTC)
}

/// Counters as they apply at `now`: (sends today, sends this hour).
pub fn effective_counts(
    limits: &RateLimits,
    pacing: &PacingCounters,
    now: DateTime<Utc>,
) -> (u32, u32) {
    let window = LocalWindow::at(timezone(limits), now);
    let today = if pacing.day_window == Some(window.day) {
        pacing.sends_today
    } else {
        0
    };
    let this_hour = if pacing.hour_window == Some(window.hour) {
        pacing.sends_this_hour
    } else {
        0
    };
    (today, this_hour)
}

/// Evaluate the policy. Precedence: daily cap, hourly cap, spacing.
pub fn evaluate(limits: &RateLimits, pacing: &PacingCounters, now: DateTime<Utc>) -> CapacityVerdict {
    let (today, this_hour) = effective_counts(limits, pacing, now);
    if today >= limits.daily_cap {
        return CapacityVerdict::BlockedDailyCap;
    }
    if this_hour >= limits.hourly_cap {
        return CapacityVerdict::BlockedHourlyCap;
    }
    if let Some(last) = pacing.last_send_at {
        let spacing = Duration::minutes(i64::from(limits.min_spacing_minutes));
        if now - last < spacing {
            return CapacityVerdict::BlockedSpacing;
        }
    }
    CapacityVerdict::Allowed
}

/// Earliest instant the spacing rule allows another send (caps not considered).
pub fn spacing_ready_at(limits: &RateLimits, pacing: &PacingCounters) -> Option<DateTime<Utc>> {
    pacing
        .last_send_at
        .map(|last| last + Duration::minutes(i64::from(limits.min_spacing_minutes)))
}

/// Account one successful send at `now`, rolling windows as needed.
pub fn record_send(limits: &RateLimits, pacing: &mut PacingCounters, now: DateTime<Utc>) {
    let window = LocalWindow::at(timezone(limits), now);
    if pacing.day_window != Some(window.day) {
        pacing.day_window = Some(window.day);
        pacing.sends_today = 0;
    }
    if pacing.hour_window != Some(window.hour) {
        pacing.hour_window = Some(window.hour);
        pacing.sends_this_hour = 0;
    }
    pacing.sends_today += 1;
    pacing.sends_this_hour += 1;
    pacing.last_send_at = Some(now);
}
