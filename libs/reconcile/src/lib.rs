//! Scale decision primitives.
//!
//! This library holds the pure parts of the autoscaling control loop:
//! everything that can be decided from counts and clocks without talking
//! to the compute fleet or the CI registry.
//!
//! - **Scale-up math**: how many runners to create given pool size,
//!   available runners, and the configured ceiling.
//! - **Scale-down selection**: which not-busy runners to remove, bounded by
//!   a down rate and protected by an idle floor.
//! - **Idle windows**: whether "now" falls inside a recurring cron window.
//! - **Retry budgets**: bounded re-evaluation of a pending scale-up.
//!
//! # Invariants
//!
//! - Scale-up never asks for more than `max_count - current` runners
//! - Selection functions only ever return items taken from their input
//! - Decisions are deterministic given the same inputs

use std::time::Duration;

use thiserror::Error;

mod idle;
mod scale;

pub use idle::{is_inside_idle_window, IdleSchedule};
pub use scale::{
    periodic_scale_down_budget, periodic_scale_up_count, select_last, select_trim, DownRate,
    ScaleUpDecision,
};

/// Errors for schedule parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    /// The timezone is not a known IANA zone.
    #[error("invalid timezone '{tz}': {message}")]
    InvalidTimezone { tz: String, message: String },
}

/// Retry budget for a pending scale-up.
///
/// Counts re-checks of a queued job; exhausted once `max_loops` re-checks
/// have been made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max_loops: u32,
    used: u32,
}

impl RetryBudget {
    /// Create a fresh budget.
    pub fn new(max_loops: u32) -> Self {
        Self { max_loops, used: 0 }
    }

    /// Rebuild a budget from a persisted counter.
    pub fn with_used(max_loops: u32, used: u32) -> Self {
        Self { max_loops, used }
    }

    /// Re-checks made so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Maximum re-checks.
    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    /// Re-checks still allowed.
    pub fn remaining(&self) -> u32 {
        self.max_loops.saturating_sub(self.used)
    }

    /// Returns true if no re-check is left.
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max_loops
    }

    /// Record one re-check and return the updated budget.
    #[must_use]
    pub fn consume(self) -> Self {
        Self {
            max_loops: self.max_loops,
            used: self.used.saturating_add(1),
        }
    }
}

/// Default number of re-checks for a job-triggered scale-up.
pub const DEFAULT_MAX_LOOPS: u32 = 3;

/// Default wait between re-checks of a job-triggered scale-up.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Default interval between periodic scale evaluations.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
