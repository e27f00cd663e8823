//! Scale-up counts and scale-down selection.

use std::fmt;

/// Outcome of evaluating a scale-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleUpDecision {
    /// The pool is at (or above) its ceiling; nothing can be created.
    AtCapacity,

    /// Create this many runners.
    Create(u32),

    /// Enough runners are available; nothing needs to be created.
    Sufficient,
}

impl ScaleUpDecision {
    /// Decide a scale-up from the current pool.
    ///
    /// - `current`: runners in the fleet (any state)
    /// - `available`: registered, not-busy, online default runners
    ///
    /// Creates `min(max_count - current, up_rate - available)` when fewer
    /// than `up_rate` runners are available.
    pub fn evaluate(max_count: u32, current: u32, up_rate: u32, available: u32) -> Self {
        let room = max_count.saturating_sub(current);
        if room == 0 {
            return Self::AtCapacity;
        }

        if available < up_rate {
            Self::Create(room.min(up_rate - available))
        } else {
            Self::Sufficient
        }
    }

    /// Number of runners to create (0 unless `Create`).
    pub fn create_count(&self) -> u32 {
        match self {
            Self::Create(n) => *n,
            _ => 0,
        }
    }
}

/// Number of runners a periodic (non job-triggered) scale-up creates.
///
/// Compares not-busy runners against `up_rate`; the shortfall is capped by
/// the room left below `max_count`.
pub fn periodic_scale_up_count(up_rate: u32, not_busy: u32, max_count: u32, current: u32) -> u32 {
    if not_busy >= up_rate {
        return 0;
    }
    let shortfall = up_rate - not_busy;
    shortfall.min(max_count.saturating_sub(current))
}

/// Maximum number of runners removed per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownRate {
    /// No limit: every eligible runner may be removed.
    Unbounded,

    /// At most this many runners.
    Limited(u32),
}

impl DownRate {
    /// Cap a count by this rate.
    pub fn cap(&self, count: u32) -> u32 {
        match self {
            Self::Unbounded => count,
            Self::Limited(limit) => count.min(*limit),
        }
    }

    /// Returns true if this rate forbids any removal.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Limited(0))
    }
}

impl From<i64> for DownRate {
    /// Negative values mean unbounded.
    fn from(value: i64) -> Self {
        if value < 0 {
            Self::Unbounded
        } else {
            Self::Limited(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl fmt::Display for DownRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => write!(f, "all"),
            Self::Limited(n) => write!(f, "{n}"),
        }
    }
}

/// Budget for a periodic scale-down.
///
/// Inside an idle window (with `idle_count > 0`), keeps `idle_count`
/// not-busy runners; otherwise every not-busy runner is eligible. The
/// result is capped by `down_rate`.
pub fn periodic_scale_down_budget(
    not_busy: u32,
    idle_count: u32,
    in_idle_window: bool,
    down_rate: DownRate,
) -> u32 {
    let eligible = if idle_count > 0 && in_idle_window {
        not_busy.saturating_sub(idle_count)
    } else {
        not_busy
    };
    down_rate.cap(eligible)
}

/// Select the last `count` items, preserving their order.
pub fn select_last<T>(mut items: Vec<T>, count: usize) -> Vec<T> {
    let start = items.len().saturating_sub(count);
    items.split_off(start)
}

/// Select not-busy runners to trim.
///
/// Takes the first `down_rate` candidates (all of them when unbounded),
/// then drops selections from the end until at least `idle_count`
/// candidates would remain.
pub fn select_trim<T>(mut candidates: Vec<T>, down_rate: DownRate, idle_count: u32) -> Vec<T> {
    if down_rate.is_zero() {
        return Vec::new();
    }

    let total = candidates.len();
    let take = match down_rate {
        DownRate::Unbounded => total,
        DownRate::Limited(n) => usize::try_from(n).unwrap_or(usize::MAX).min(total),
    };
    candidates.truncate(take);

    let idle_floor = usize::try_from(idle_count).unwrap_or(usize::MAX);
    while !candidates.is_empty() && total - candidates.len() < idle_floor {
        candidates.pop();
    }

    candidates
}
