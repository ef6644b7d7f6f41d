//! Window planning
//!
//! Decides, from the persisted watermark and the current time, which time
//! window a run queries and whether the run is due at all.

use chrono::{DateTime, Duration, Utc};
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::query::format_timestamp;
use std::fmt;

/// How a job derives its extraction window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// From the watermark (or the start of today) up to now
    UnboundedForward,
    /// Fixed-size windows starting at the watermark, due once fully elapsed
    FixedDuration(Duration),
    /// Full-state snapshots, no window and no watermark
    Unwindowed,
}

/// Half-open time range `[start, end)` queried by one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ExtractionWindow {
    /// Create a window; `end` must be after `start`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(CrmTrailError::State(format!(
                "Empty extraction window [{}, {})",
                format_timestamp(&start),
                format_timestamp(&end)
            )));
        }
        Ok(Self { start, end })
    }

    /// Inclusive lower bound
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive upper bound
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

impl fmt::Display for ExtractionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_timestamp(&self.start), format_timestamp(&self.end))
    }
}

/// Outcome of planning a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Query this window now
    Due(ExtractionWindow),
    /// Nothing to do yet; `due_at` is when the next window closes
    Pending {
        /// Earliest time the next run can be due
        due_at: DateTime<Utc>,
    },
    /// A duration job has no starting watermark
    NoBaseline,
    /// Snapshot job, always runs without a window
    Unwindowed,
}

/// Plan one run of a job with `policy`
///
/// Fails only when a fixed window would end beyond the representable range.
pub fn plan(policy: WindowPolicy, watermark: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<WindowDecision> {
    let decision = match policy {
        WindowPolicy::Unwindowed => WindowDecision::Unwindowed,
        WindowPolicy::UnboundedForward => {
            let start = watermark.unwrap_or_else(|| start_of_day(now));
            match ExtractionWindow::new(start, now) {
                Ok(window) => WindowDecision::Due(window),
                // watermark ahead of the local clock
                Err(_) => WindowDecision::Pending { due_at: start },
            }
        }
        WindowPolicy::FixedDuration(duration) => {
            let Some(start) = watermark else {
                return Ok(WindowDecision::NoBaseline);
            };
            let end = start.checked_add_signed(duration).ok_or_else(|| {
                CrmTrailError::Config(format!(
                    "Window of {} minutes from {} is out of range",
                    duration.num_minutes(),
                    format_timestamp(&start)
                ))
            })?;
            if end > now {
                return Ok(WindowDecision::Pending { due_at: end });
            }
            match ExtractionWindow::new(start, end) {
                Ok(window) => WindowDecision::Due(window),
                Err(_) => WindowDecision::Pending { due_at: end },
            }
        }
    };
    Ok(decision)
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_hms_opt(0, 0, 0).map(|midnight| midnight.and_utc()).unwrap_or(now)
}
