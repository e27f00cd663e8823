//! Scale policy.
//!
//! Every decision path follows the same shape: take the environment's scale
//! lease, read fresh inventory, decide with the pure functions of
//! `runpool-reconcile`, then act through the [`FleetExecutor`].
//!
//! ## Job-triggered scale-up
//!
//! A scale-up triggered for a queued job is a resumable [`ScaleUpTask`].
//! Each call to [`ScalePolicy::step`] performs one evaluation and returns
//! the next [`ScaleUpState`]:
//!
//! ```text
//! Evaluate ──► AtCapacity | Scaled | Idle
//!    │
//!    └─► Waiting(task) ──(retry_wait)──► Recheck ──► JobStarted
//!                                           │
//!                                           └─► Evaluate ... ──► GivenUp
//! ```
//!
//! The task counts re-checks of the job's check run. Once `max_loops`
//! re-checks have found the job still queued while enough runners are
//! available, the task gives up without creating anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runpool_id::{RunnerName, RunnerType};
use runpool_reconcile::{
    periodic_scale_down_budget, periodic_scale_up_count, select_last, select_trim, DownRate,
    IdleSchedule, RetryBudget, ScaleUpDecision, DEFAULT_MAX_LOOPS, DEFAULT_RETRY_WAIT,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::executor::{BatchOutcome, FleetExecutor};
use crate::inventory::{Runner, RunnerInventory};
use crate::lease::{LeaseGuard, ScaleLease};
use crate::registry::{JobContext, RunnerRegistry};

/// Default TTL of the scale lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// Policy parameters, fixed for one invocation.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Ceiling on the fleet size.
    pub max_count: u32,
    /// Target number of available runners.
    pub up_rate: u32,
    /// Maximum removals per scale-down.
    pub down_rate: DownRate,
    /// Not-busy runners kept during idle windows and by smart scale-down.
    pub idle_count: u32,
    pub idle_schedule: Option<IdleSchedule>,
    /// Runners younger than this are never removed by smart scale-down.
    pub min_age: Duration,
    /// Re-checks of a queued job before a scale-up gives up.
    pub max_loops: u32,
    /// Wait between re-checks.
    pub retry_wait: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_count: 10,
            up_rate: 1,
            down_rate: DownRate::Limited(1),
            idle_count: 0,
            idle_schedule: None,
            min_age: Duration::ZERO,
            max_loops: DEFAULT_MAX_LOOPS,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }
}

/// Length of an inventory listing as a runner count.
fn count<T>(items: &[T]) -> u32 {
    u32::try_from(items.len()).unwrap_or(u32::MAX)
}

/// Result of a lease-protected decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<T> {
    /// The decision ran and acted.
    Applied(T),
    /// Another decision for the environment was in flight; nothing was done.
    Contended,
}

impl<T> Decision<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Decision::Applied(value) => Some(value),
            Decision::Contended => None,
        }
    }
}

/// What the next step of a scale-up task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleUpPhase {
    /// Read the pool and decide.
    Evaluate,
    /// Check whether the job is still queued, then evaluate again.
    Recheck,
}

/// A resumable job-triggered scale-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpTask {
    pub job: Option<JobContext>,
    /// Re-checks made so far.
    pub rechecks: u32,
    pub phase: ScaleUpPhase,
}

impl ScaleUpTask {
    pub fn new(job: Option<JobContext>) -> Self {
        Self {
            job,
            rechecks: 0,
            phase: ScaleUpPhase::Evaluate,
        }
    }

    pub fn budget(&self, max_loops: u32) -> RetryBudget {
        RetryBudget::with_used(max_loops, self.rechecks)
    }

    fn waiting(mut self, phase: ScaleUpPhase) -> Self {
        self.phase = phase;
        self
    }
}

/// State after one scale-up step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleUpState {
    /// The fleet is at its ceiling.
    AtCapacity,
    /// Runners were created.
    Scaled(BatchOutcome),
    /// Resume this task after the retry wait.
    Waiting(ScaleUpTask),
    /// The re-check budget ran out.
    GivenUp(ScaleUpTask),
    /// The job left the queue.
    JobStarted,
    /// No job to wait for and no runner needed.
    Idle,
    /// Another decision was in flight and no job is waiting.
    Contended,
}

impl ScaleUpState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScaleUpState::Waiting(_))
    }
}

/// Results of both smart scale-down passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmartScaleDownOutcome {
    /// Offline runners removed.
    pub offline: BatchOutcome,
    /// Not-busy runners trimmed.
    pub trimmed: BatchOutcome,
}

/// Scale decisions for one environment.
pub struct ScalePolicy {
    inventory: RunnerInventory,
    executor: FleetExecutor,
    registry: Arc<dyn RunnerRegistry>,
    lease: Arc<dyn ScaleLease>,
    config: PolicyConfig,
    lease_ttl: Duration,
}

impl ScalePolicy {
    pub fn new(
        inventory: RunnerInventory,
        executor: FleetExecutor,
        registry: Arc<dyn RunnerRegistry>,
        lease: Arc<dyn ScaleLease>,
        config: PolicyConfig,
    ) -> Self {
        Self {
            inventory,
            executor,
            registry,
            lease,
            config,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn inventory(&self) -> &RunnerInventory {
        &self.inventory
    }

    pub fn executor(&self) -> &FleetExecutor {
        &self.executor
    }

    async fn acquire(&self) -> Result<Option<LeaseGuard>> {
        let guard = self
            .lease
            .try_acquire(self.inventory.naming().env(), self.lease_ttl)
            .await?;
        if guard.is_none() {
            info!(
                env = %self.inventory.naming().env(),
                "Another scale decision is in flight, skipping"
            );
        }
        Ok(guard)
    }

    fn is_default(&self, runner: &Runner) -> bool {
        self.inventory.naming().classify(runner.name()) == Some(RunnerType::Default)
    }

    // =========================================================================
    // Scale up
    // =========================================================================

    /// Run one step of a job-triggered scale-up.
    #[instrument(skip(self, task), fields(rechecks = task.rechecks, phase = ?task.phase))]
    pub async fn step(&self, task: ScaleUpTask) -> Result<ScaleUpState> {
        let task = match task.phase {
            ScaleUpPhase::Evaluate => task,
            ScaleUpPhase::Recheck => match &task.job {
                Some(job) => {
                    let check_run = self.registry.get_check_run(job).await?;
                    if !check_run.status.is_queued() {
                        info!(
                            check_run_id = job.check_run_id,
                            status = ?check_run.status,
                            "Job left the queue, no scale up needed"
                        );
                        return Ok(ScaleUpState::JobStarted);
                    }
                    info!(check_run_id = job.check_run_id, "Job is still queued");
                    ScaleUpTask {
                        rechecks: task.rechecks.saturating_add(1),
                        phase: ScaleUpPhase::Evaluate,
                        ..task
                    }
                }
                None => task.waiting(ScaleUpPhase::Evaluate),
            },
        };

        let Some(_guard) = self.acquire().await? else {
            return Ok(self.wait_or_give_up(task, ScaleUpPhase::Evaluate, "lease contended"));
        };

        let current = count(&self.inventory.list_fleet_runners(None).await?);
        let available = count(&self.inventory.list_available().await?);
        let decision = ScaleUpDecision::evaluate(
            self.config.max_count,
            current,
            self.config.up_rate,
            available,
        );

        match decision {
            ScaleUpDecision::AtCapacity => {
                warn!(
                    max_count = self.config.max_count,
                    current, "Unable to scale up, runner count limit reached"
                );
                Ok(ScaleUpState::AtCapacity)
            }
            ScaleUpDecision::Create(count) => {
                info!(current, available, count, "Scaling up");
                let outcome = self
                    .executor
                    .create_runners(RunnerType::Default, count)
                    .await;
                Ok(ScaleUpState::Scaled(outcome))
            }
            ScaleUpDecision::Sufficient => {
                if task.job.is_none() {
                    info!(available, "No scale up needed");
                    return Ok(ScaleUpState::Idle);
                }
                Ok(self.wait_or_give_up(task, ScaleUpPhase::Recheck, "runners available"))
            }
        }
    }

    fn wait_or_give_up(&self, task: ScaleUpTask, next: ScaleUpPhase, reason: &str) -> ScaleUpState {
        let Some(job) = &task.job else {
            return ScaleUpState::Contended;
        };

        let budget = task.budget(self.config.max_loops);
        if budget.is_exhausted() {
            warn!(
                owner = %job.owner,
                repo = %job.repo,
                check_run_id = job.check_run_id,
                rechecks = task.rechecks,
                "Scale up retried too many times, giving up"
            );
            return ScaleUpState::GivenUp(task);
        }

        info!(
            check_run_id = job.check_run_id,
            reason,
            wait_ms = self.config.retry_wait.as_millis() as u64,
            remaining = budget.remaining(),
            "Waiting before re-checking the job"
        );
        // Contention spends a re-check so the task stays bounded.
        let rechecks = if next == ScaleUpPhase::Evaluate {
            task.rechecks.saturating_add(1)
        } else {
            task.rechecks
        };
        ScaleUpState::Waiting(ScaleUpTask {
            rechecks,
            ..task.waiting(next)
        })
    }

    /// Periodic scale-up: top up not-busy runners to `up_rate`.
    #[instrument(skip(self))]
    pub async fn scale_up(&self) -> Result<Decision<BatchOutcome>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };

        let not_busy = count(&self.inventory.list_not_busy().await?);
        if not_busy >= self.config.up_rate {
            info!(not_busy, up_rate = self.config.up_rate, "Enough not-busy runners, nothing to do");
            return Ok(Decision::Applied(BatchOutcome::default()));
        }

        let current = count(&self.inventory.list_fleet_runners(None).await?);
        let count = periodic_scale_up_count(
            self.config.up_rate,
            not_busy,
            self.config.max_count,
            current,
        );
        info!(not_busy, current, max_count = self.config.max_count, count, "Evaluated scale up");

        if count == 0 {
            return Ok(Decision::Applied(BatchOutcome::default()));
        }
        Ok(Decision::Applied(
            self.executor.create_runners(RunnerType::Default, count).await,
        ))
    }

    /// Create runners until the fleet reaches `max_count`.
    #[instrument(skip(self))]
    pub async fn scale_up_all(&self) -> Result<Decision<BatchOutcome>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };

        let current = count(&self.inventory.list_fleet_runners(None).await?);
        let count = self.config.max_count.saturating_sub(current);
        info!(current, max_count = self.config.max_count, count, "Scaling up to max count");

        if count == 0 {
            return Ok(Decision::Applied(BatchOutcome::default()));
        }
        Ok(Decision::Applied(
            self.executor.create_runners(RunnerType::Default, count).await,
        ))
    }

    /// Create a ghost runner unless one is registered. Returns the new
    /// runner's name.
    #[instrument(skip(self))]
    pub async fn ensure_ghost(&self) -> Result<Decision<Option<RunnerName>>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };

        if self.inventory.ghost_exists().await? {
            info!("Ghost runner exists, nothing to do");
            return Ok(Decision::Applied(None));
        }

        let name = self.executor.create_runner(RunnerType::Ghost).await?;
        Ok(Decision::Applied(Some(name)))
    }

    // =========================================================================
    // Scale down
    // =========================================================================

    /// Delete the last `count` not-busy runners present in both the
    /// registry and the fleet, in ascending registry id order.
    #[instrument(skip(self))]
    pub async fn scale_down(&self, count: u32) -> Result<Decision<BatchOutcome>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };
        self.scale_down_locked(count).await.map(Decision::Applied)
    }

    async fn scale_down_locked(&self, count: u32) -> Result<BatchOutcome> {
        if count == 0 {
            info!("Scale down count is 0, nothing to do");
            return Ok(BatchOutcome::default());
        }

        let candidates: Vec<String> = self
            .inventory
            .list_runners(None)
            .await?
            .into_iter()
            .filter(|r| r.is_idle() && self.is_default(r))
            .map(|r| r.name().to_string())
            .collect();
        let selected = select_last(candidates, usize::try_from(count).unwrap_or(usize::MAX));
        info!(count, selected = selected.len(), "Scaling down not-busy runners");

        let outcome = self.executor.delete_runners(selected).await?;
        info!(
            deleted = outcome.succeeded_count(),
            failed = outcome.failed_count(),
            retained_busy = outcome.retained_count(),
            "Scale down finished"
        );
        Ok(outcome)
    }

    /// Periodic scale-down. Inside the idle window `idle_count` not-busy
    /// runners are kept; the budget is capped by `down_rate`.
    #[instrument(skip(self))]
    pub async fn periodic_scale_down(&self, now: DateTime<Utc>) -> Result<Decision<BatchOutcome>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };

        let not_busy = count(&self.inventory.list_not_busy().await?);
        if not_busy == 0 {
            info!("No not-busy runners, nothing to do");
            return Ok(Decision::Applied(BatchOutcome::default()));
        }

        let in_idle_window = self.config.idle_count > 0
            && self
                .config
                .idle_schedule
                .as_ref()
                .is_some_and(|schedule| schedule.contains(now));
        let budget = periodic_scale_down_budget(
            not_busy,
            self.config.idle_count,
            in_idle_window,
            self.config.down_rate,
        );
        info!(
            not_busy,
            in_idle_window,
            idle_schedule = self.config.idle_schedule.as_ref().map(IdleSchedule::expr),
            idle_count = self.config.idle_count,
            down_rate = %self.config.down_rate,
            budget,
            "Evaluated scale down"
        );

        self.scale_down_locked(budget).await.map(Decision::Applied)
    }

    /// Delete every not-busy runner of the environment.
    #[instrument(skip(self))]
    pub async fn scale_down_all(&self) -> Result<Decision<BatchOutcome>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };

        let fleet_size = count(&self.inventory.list_fleet_runners(None).await?);
        self.scale_down_locked(fleet_size).await.map(Decision::Applied)
    }

    /// Two-pass scale-down over runners at least `min_age` old.
    ///
    /// Pass 1 deletes every offline runner. Pass 2 deletes up to
    /// `down_rate` not-busy runners while keeping `idle_count` of them;
    /// `down_rate = 0` skips it.
    #[instrument(skip(self, down_rate), fields(down_rate = %down_rate))]
    pub async fn smart_scale_down(
        &self,
        down_rate: DownRate,
        idle_count: u32,
        min_age: Duration,
    ) -> Result<Decision<SmartScaleDownOutcome>> {
        let Some(_guard) = self.acquire().await? else {
            return Ok(Decision::Contended);
        };

        let runners: Vec<Runner> = self
            .inventory
            .list_runners(Some(min_age))
            .await?
            .into_iter()
            .filter(|r| self.is_default(r))
            .collect();

        let offline: Vec<String> = runners
            .iter()
            .filter(|r| r.is_offline())
            .map(|r| r.name().to_string())
            .collect();
        info!(
            count = offline.len(),
            min_age_secs = min_age.as_secs(),
            "Removing offline runners"
        );
        let mut outcome = SmartScaleDownOutcome {
            offline: self.executor.delete_runners(offline.clone()).await?,
            ..Default::default()
        };

        if down_rate.is_zero() {
            info!("Scale down rate is 0, skipping not-busy trim");
            return Ok(Decision::Applied(outcome));
        }

        let candidates: Vec<String> = runners
            .iter()
            .filter(|r| r.is_idle() && !offline.iter().any(|name| name == r.name()))
            .map(|r| r.name().to_string())
            .collect();
        let not_busy = candidates.len();
        let selected = select_trim(candidates, down_rate, idle_count);
        info!(not_busy, idle_count, selected = selected.len(), "Trimming not-busy runners");

        outcome.trimmed = self.executor.delete_runners(selected).await?;
        info!(
            offline_deleted = outcome.offline.succeeded_count(),
            deleted = outcome.trimmed.succeeded_count(),
            kept = not_busy.saturating_sub(outcome.trimmed.succeeded_count()),
            retained_busy = outcome.offline.retained_count() + outcome.trimmed.retained_count(),
            failed = outcome.offline.failed_count() + outcome.trimmed.failed_count(),
            "Smart scale down finished"
        );
        Ok(Decision::Applied(outcome))
    }

    /// Smart scale-down with the configured parameters.
    pub async fn smart_scale_down_configured(&self) -> Result<Decision<SmartScaleDownOutcome>> {
        self.smart_scale_down(
            self.config.down_rate,
            self.config.idle_count,
            self.config.min_age,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobContext {
        JobContext {
            owner: "acme".to_string(),
            repo: "app".to_string(),
            check_run_id: 7,
        }
    }

    #[test]
    fn test_task_round_trips_as_json() {
        let task = ScaleUpTask {
            job: Some(job()),
            rechecks: 2,
            phase: ScaleUpPhase::Recheck,
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"phase\":\"recheck\""));
        let back: ScaleUpTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.budget(3).remaining(), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ScaleUpState::Waiting(ScaleUpTask::new(None)).is_terminal());
        assert!(ScaleUpState::GivenUp(ScaleUpTask::new(Some(job()))).is_terminal());
        assert!(ScaleUpState::Idle.is_terminal());
        assert!(ScaleUpState::Contended.is_terminal());
    }

    #[test]
    fn test_decision_applied() {
        assert_eq!(Decision::Applied(3).applied(), Some(3));
        assert_eq!(Decision::<u32>::Contended.applied(), None);
    }

    #[test]
    fn test_count() {
        assert_eq!(count(&["a", "b", "c"]), 3);
        assert_eq!(count::<u8>(&[]), 0);
    }
}
