//! Periodic scale loop.
//!
//! On every tick the worker:
//! - Scales down (two-pass smart scale-down, or the idle-window aware
//!   periodic scale-down)
//! - Scales up to keep `up_rate` not-busy runners
//!
//! A failed tick is logged and the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runpool_reconcile::DEFAULT_RECONCILE_INTERVAL;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::policy::{Decision, ScalePolicy};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between ticks.
    pub interval: Duration,

    /// Use the two-pass smart scale-down.
    pub smart_scale_down: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONCILE_INTERVAL,
            smart_scale_down: true,
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub deleted: usize,
    pub created: usize,
    pub failed: usize,
    /// Decisions skipped because the lease was held.
    pub contended: usize,
}

/// Periodic scale worker.
pub struct ScaleWorker {
    policy: Arc<ScalePolicy>,
    config: WorkerConfig,
}

impl ScaleWorker {
    pub fn new(policy: Arc<ScalePolicy>, config: WorkerConfig) -> Self {
        Self { policy, config }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            smart_scale_down = self.config.smart_scale_down,
            "Starting scale worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) => debug!(?stats, "Scale tick finished"),
                        Err(e) => error!(error = %e, "Scale tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scale worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform one scale-down and one scale-up pass.
    pub async fn tick(&self) -> Result<TickStats> {
        let mut stats = TickStats::default();

        if self.config.smart_scale_down {
            match self.policy.smart_scale_down_configured().await? {
                Decision::Applied(outcome) => {
                    stats.deleted +=
                        outcome.offline.succeeded_count() + outcome.trimmed.succeeded_count();
                    stats.failed +=
                        outcome.offline.failed_count() + outcome.trimmed.failed_count();
                }
                Decision::Contended => stats.contended += 1,
            }
        } else {
            match self.policy.periodic_scale_down(Utc::now()).await? {
                Decision::Applied(outcome) => {
                    stats.deleted += outcome.succeeded_count();
                    stats.failed += outcome.failed_count();
                }
                Decision::Contended => stats.contended += 1,
            }
        }

        match self.policy.scale_up().await? {
            Decision::Applied(outcome) => {
                stats.created += outcome.succeeded_count();
                stats.failed += outcome.failed_count();
            }
            Decision::Contended => stats.contended += 1,
        }

        Ok(stats)
    }
}
