//! Retry scheduler for job-triggered scale-ups.
//!
//! Drives a [`ScaleUpTask`] to a terminal state: one policy step at a time,
//! sleeping the retry wait between steps. Shutdown is honored between
//! steps; an interrupted task is returned as `Waiting` so the caller can
//! hand it to another scheduler.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::policy::{ScalePolicy, ScaleUpState, ScaleUpTask};

/// Resumes waiting scale-up tasks.
pub struct RetryScheduler {
    policy: Arc<ScalePolicy>,
}

impl RetryScheduler {
    pub fn new(policy: Arc<ScalePolicy>) -> Self {
        Self { policy }
    }

    /// Step `task` until it reaches a terminal state or shutdown is
    /// signalled.
    #[instrument(skip(self, task, shutdown), name = "scale_up_retry")]
    pub async fn run(
        &self,
        mut task: ScaleUpTask,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ScaleUpState> {
        let wait = self.policy.config().retry_wait;

        loop {
            let state = self.policy.step(task).await?;
            let next = match state {
                ScaleUpState::Waiting(next) => next,
                terminal => {
                    debug!(state = ?terminal, "Scale up task finished");
                    return Ok(terminal);
                }
            };

            if *shutdown.borrow() {
                info!("Shutdown signal received, leaving scale up task pending");
                return Ok(ScaleUpState::Waiting(next));
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received during retry wait");
                        return Ok(ScaleUpState::Waiting(next));
                    }
                }
                _ = sleep(wait) => {}
            }
            task = next;
        }
    }

    /// Step `task` to completion with no shutdown signal.
    pub async fn run_to_completion(&self, task: ScaleUpTask) -> Result<ScaleUpState> {
        let (_tx, rx) = watch::channel(false);
        self.run(task, rx).await
    }
}
