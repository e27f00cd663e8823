//! Fleet executor: the only component that mutates the pool.
//!
//! Creating a runner means minting a registration token, creating a VM that
//! carries it, waiting for the VM to run and then for the runner to show up
//! in the registry with the status its type implies. Deleting a runner means
//! unregistering it; the VM powers itself off from its shutdown script.
//!
//! A provisioning timeout leaves the VM in place. Such VMs surface through
//! [`RunnerInventory::list_stale_unregistered`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use runpool_id::{RunnerName, RunnerType};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fleet::{Fleet, VmConfig, VmStatus};
use crate::inventory::RunnerInventory;
use crate::registry::{RunnerRegistry, RunnerStatus};

/// Timeouts for provisioning a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionTimings {
    /// Maximum wait for the VM to reach `RUNNING`.
    pub running_timeout: Duration,
    /// Interval between registry status checks.
    pub registry_poll: Duration,
    /// Maximum wait for the runner to reach its registry status.
    pub registry_timeout: Duration,
}

impl Default for ProvisionTimings {
    fn default() -> Self {
        Self {
            running_timeout: Duration::from_secs(300),
            registry_poll: Duration::from_secs(10),
            registry_timeout: Duration::from_secs(120),
        }
    }
}

/// Everything a runner VM is created from, apart from its name, type and
/// registration token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerTemplate {
    pub machine_type: String,
    pub image: String,
    pub network: String,
    pub preemptible: bool,
    pub service_account: Option<String>,
    pub github_org: String,
    pub runner_labels: Option<String>,
    pub taint_labels: Option<String>,
    pub remove_token_url: Option<String>,
    pub startup_script: Option<String>,
    pub shutdown_script: Option<String>,
}

impl RunnerTemplate {
    /// VM settings for one runner.
    pub fn vm_config(&self, env: &str, runner_type: RunnerType, token: &str) -> VmConfig {
        let labels = BTreeMap::from([
            ("type".to_string(), runner_type.to_string()),
            ("env".to_string(), env.to_string()),
        ]);

        let mut metadata = BTreeMap::from([
            ("type".to_string(), runner_type.to_string()),
            ("env".to_string(), env.to_string()),
            ("registration-token".to_string(), token.to_string()),
            ("github-org".to_string(), self.github_org.clone()),
        ]);
        let optional = [
            ("runner-labels", &self.runner_labels),
            ("get-remove-token-trigger-url", &self.remove_token_url),
            ("taint-labels", &self.taint_labels),
            ("startup-script", &self.startup_script),
            ("shutdown-script", &self.shutdown_script),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.clone());
            }
        }

        VmConfig {
            machine_type: self.machine_type.clone(),
            image: self.image.clone(),
            network: self.network.clone(),
            preemptible: self.preemptible,
            service_account: self.service_account.clone(),
            labels,
            metadata,
        }
    }
}

/// Result of deleting one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The runner was unregistered.
    Deleted { id: u64 },
    /// The registry did not know the runner.
    AlreadyGone,
    /// The runner picked up a job and was left registered.
    Busy { id: u64 },
}

/// Per-runner results of a parallel batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    /// Runner name and error message.
    pub failed: Vec<(String, String)>,
    /// Runners found busy when the batch ran, left untouched.
    pub retained: Vec<String>,
}

impl BatchOutcome {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.retained.is_empty()
    }

    fn record<T>(&mut self, name: String, result: Result<T>) {
        match result {
            Ok(_) => self.succeeded.push(name),
            Err(e) => self.failed.push((name, e.to_string())),
        }
    }
}

/// Registry status a freshly created runner must reach.
fn expected_status(runner_type: RunnerType) -> RunnerStatus {
    match runner_type {
        RunnerType::Default => RunnerStatus::Online,
        // Ghost runners register and immediately go away.
        RunnerType::Ghost => RunnerStatus::Offline,
    }
}

/// Creates and deletes runners.
#[derive(Clone)]
pub struct FleetExecutor {
    fleet: Arc<dyn Fleet>,
    registry: Arc<dyn RunnerRegistry>,
    inventory: RunnerInventory,
    template: RunnerTemplate,
    timings: ProvisionTimings,
}

impl FleetExecutor {
    pub fn new(
        fleet: Arc<dyn Fleet>,
        registry: Arc<dyn RunnerRegistry>,
        inventory: RunnerInventory,
        template: RunnerTemplate,
    ) -> Self {
        Self {
            fleet,
            registry,
            inventory,
            template,
            timings: ProvisionTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ProvisionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Create one runner and wait until it is registered.
    pub async fn create_runner(&self, runner_type: RunnerType) -> Result<RunnerName> {
        let name = self.inventory.naming().generate(runner_type);
        self.create_named(&name, runner_type).await?;
        Ok(name)
    }

    async fn create_named(&self, name: &RunnerName, runner_type: RunnerType) -> Result<()> {
        info!(name = %name, runner_type = %runner_type, "Creating runner");

        let token = self.registry.create_registration_token().await?;
        let config = self
            .template
            .vm_config(self.inventory.naming().env(), runner_type, &token);

        self.fleet.create_vm(name.as_str(), &config).await?;
        self.fleet
            .wait_for_state(name.as_str(), VmStatus::Running, self.timings.running_timeout)
            .await
            .inspect_err(|e| warn!(name = %name, error = %e, "VM did not start, left in place"))?;
        debug!(name = %name, "Runner VM running");

        let target = expected_status(runner_type);
        self.wait_for_registry_status(name.as_str(), target)
            .await
            .inspect_err(|e| {
                warn!(name = %name, error = %e, "Runner did not register, VM left in place")
            })?;

        info!(name = %name, status = %target, "Runner created and registered");
        Ok(())
    }

    async fn wait_for_registry_status(&self, name: &str, target: RunnerStatus) -> Result<()> {
        let poll = async {
            loop {
                if self.inventory.status_matches(name, target).await? {
                    return Ok(());
                }
                debug!(name = %name, target = %target, "Runner not registered yet");
                tokio::time::sleep(self.timings.registry_poll).await;
            }
        };

        match tokio::time::timeout(self.timings.registry_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProvisionTimeout {
                name: name.to_string(),
                expected: target.to_string(),
                timeout: self.timings.registry_timeout,
            }),
        }
    }

    /// Create `count` runners in parallel. A failed create does not abort
    /// the others.
    pub async fn create_runners(&self, runner_type: RunnerType, count: u32) -> BatchOutcome {
        let names: Vec<RunnerName> = (0..count)
            .map(|_| self.inventory.naming().generate(runner_type))
            .collect();

        let results = join_all(names.iter().map(|name| self.create_named(name, runner_type))).await;

        let mut outcome = BatchOutcome::default();
        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = &result {
                warn!(name = %name, error = %e, "Failed to create runner");
            }
            outcome.record(name.into_string(), result);
        }

        info!(
            requested = count,
            created = outcome.succeeded_count(),
            failed = outcome.failed_count(),
            "Scale up batch finished"
        );
        outcome
    }

    /// Unregister a runner by name. Unknown names are a no-op and busy
    /// runners are refused.
    pub async fn delete_runner(&self, name: &str) -> Result<DeleteOutcome> {
        let Some(runner) = self.inventory.runner_by_name(name).await? else {
            info!(name = %name, "Runner not registered, nothing to delete");
            return Ok(DeleteOutcome::AlreadyGone);
        };

        if runner.busy {
            warn!(name = %name, runner_id = runner.id, "Runner is busy, not deleting");
            return Ok(DeleteOutcome::Busy { id: runner.id });
        }
        self.registry.delete_runner(runner.id).await?;
        info!(name = %name, runner_id = runner.id, "Runner deleted");
        Ok(DeleteOutcome::Deleted { id: runner.id })
    }

    /// Unregister runners in parallel. A failed delete does not block the
    /// others; unknown names count as deleted.
    ///
    /// Busy state is read again from the registry before deleting, since a
    /// runner may pick up a job after it was selected. Busy runners are
    /// retained.
    pub async fn delete_runners(&self, names: Vec<String>) -> Result<BatchOutcome> {
        if names.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let registered: HashMap<String, (u64, bool)> = self
            .inventory
            .list_registry_runners()
            .await?
            .into_iter()
            .map(|r| (r.name, (r.id, r.busy)))
            .collect();

        let deletes = names.iter().map(|name| {
            let runner = registered.get(name).copied();
            async move {
                match runner {
                    Some((id, true)) => Ok(DeleteOutcome::Busy { id }),
                    Some((id, false)) => self
                        .registry
                        .delete_runner(id)
                        .await
                        .map(|()| DeleteOutcome::Deleted { id }),
                    None => Ok(DeleteOutcome::AlreadyGone),
                }
            }
        });
        let results = join_all(deletes).await;

        let mut outcome = BatchOutcome::default();
        for (name, result) in names.into_iter().zip(results) {
            match &result {
                Ok(DeleteOutcome::Deleted { id }) => {
                    info!(name = %name, runner_id = id, "Runner deleted")
                }
                Ok(DeleteOutcome::AlreadyGone) => {
                    info!(name = %name, "Runner already gone")
                }
                Ok(DeleteOutcome::Busy { id }) => {
                    info!(name = %name, runner_id = id, "Runner became busy, retained");
                    outcome.retained.push(name);
                    continue;
                }
                Err(e) => warn!(name = %name, error = %e, "Failed to delete runner"),
            }
            outcome.record(name, result);
        }

        Ok(outcome)
    }
}
