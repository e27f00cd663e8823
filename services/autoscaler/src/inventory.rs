//! Read-only view over the fleet and the registry.
//!
//! The two inventories mutate independently: a VM exists before its runner
//! registers, and a registry entry can outlive its VM. [`Runner`] makes the
//! three combinations explicit so a filter cannot read `busy` or `status`
//! off a runner the registry does not know.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use runpool_id::{RunnerNaming, RunnerType};
use tracing::debug;

use crate::error::Result;
use crate::fleet::{env_filter, Fleet, VmStatus};
use crate::registry::{RegistryRunner, RunnerRegistry, RunnerStatus};

/// A runner VM as seen by the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetRunner {
    pub name: String,
    /// Type recovered from the name; `None` for VMs that do not follow
    /// the naming scheme.
    pub runner_type: Option<RunnerType>,
    pub status: VmStatus,
    pub labels: BTreeMap<String, String>,
    /// Set when the listing fetched per-VM metadata.
    pub created_at: Option<DateTime<Utc>>,
}

impl FleetRunner {
    /// Age at `now`, if the creation time is known.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.created_at
            .map(|created| (now - created).to_std().unwrap_or(Duration::ZERO))
    }
}

/// A runner correlated across both inventories by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runner {
    /// VM exists; the registry does not know the runner (yet).
    FleetOnly(FleetRunner),
    /// The registry knows the runner; no matching VM.
    RegistryOnly(RegistryRunner),
    /// Both sides agree the runner exists.
    Fused {
        fleet: FleetRunner,
        registry: RegistryRunner,
    },
}

impl Runner {
    pub fn name(&self) -> &str {
        match self {
            Runner::FleetOnly(fleet) => &fleet.name,
            Runner::RegistryOnly(registry) => &registry.name,
            Runner::Fused { registry, .. } => &registry.name,
        }
    }

    pub fn fleet(&self) -> Option<&FleetRunner> {
        match self {
            Runner::FleetOnly(fleet) | Runner::Fused { fleet, .. } => Some(fleet),
            Runner::RegistryOnly(_) => None,
        }
    }

    pub fn registry(&self) -> Option<&RegistryRunner> {
        match self {
            Runner::RegistryOnly(registry) | Runner::Fused { registry, .. } => Some(registry),
            Runner::FleetOnly(_) => None,
        }
    }

    /// Present in both inventories and not running a job.
    pub fn is_idle(&self) -> bool {
        matches!(self, Runner::Fused { registry, .. } if !registry.busy)
    }

    /// Present in both inventories, reported offline and not running a job.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            Runner::Fused { registry, .. }
                if registry.status == RunnerStatus::Offline && !registry.busy
        )
    }
}

/// Fused, read-only view of the runner pool of one environment.
#[derive(Clone)]
pub struct RunnerInventory {
    fleet: Arc<dyn Fleet>,
    registry: Arc<dyn RunnerRegistry>,
    naming: RunnerNaming,
}

impl RunnerInventory {
    pub fn new(
        fleet: Arc<dyn Fleet>,
        registry: Arc<dyn RunnerRegistry>,
        naming: RunnerNaming,
    ) -> Self {
        Self {
            fleet,
            registry,
            naming,
        }
    }

    pub fn naming(&self) -> &RunnerNaming {
        &self.naming
    }

    /// All VMs of the environment, with creation times when requested.
    ///
    /// VMs that disappear between the listing and their metadata fetch are
    /// left out.
    async fn fleet_runners(&self, with_metadata: bool) -> Result<Vec<FleetRunner>> {
        let vms = self.fleet.list_vms(&env_filter(self.naming.env())).await?;

        let created: Vec<Option<DateTime<Utc>>> = if with_metadata {
            let lookups = vms.iter().map(|vm| self.fleet.get_vm_metadata(&vm.name));
            join_all(lookups)
                .await
                .into_iter()
                .map(|metadata| metadata.map(|m| m.map(|m| m.creation_timestamp)))
                .collect::<Result<_>>()?
        } else {
            vec![None; vms.len()]
        };

        Ok(vms
            .into_iter()
            .zip(created)
            .filter(|(vm, created_at)| {
                let vanished = with_metadata && created_at.is_none();
                if vanished {
                    debug!(name = %vm.name, "VM vanished after listing");
                }
                !vanished
            })
            .map(|(vm, created_at)| FleetRunner {
                runner_type: self.naming.classify(&vm.name),
                name: vm.name,
                status: vm.status,
                labels: vm.labels,
                created_at,
            })
            .collect())
    }

    /// VMs labeled with the environment. With `min_age`, only VMs at least
    /// that old are kept; their ages are fetched in parallel.
    pub async fn list_fleet_runners(&self, min_age: Option<Duration>) -> Result<Vec<FleetRunner>> {
        let runners = self.fleet_runners(min_age.is_some()).await?;
        let Some(min_age) = min_age else {
            return Ok(runners);
        };

        let now = Utc::now();
        let total = runners.len();
        let aged: Vec<_> = runners
            .into_iter()
            .filter(|r| r.age(now).is_some_and(|age| age >= min_age))
            .collect();
        debug!(
            total,
            aged = aged.len(),
            min_age_secs = min_age.as_secs(),
            "Listed aged fleet runners"
        );
        Ok(aged)
    }

    /// Every runner of the organization, ascending by registry id.
    pub async fn list_registry_runners(&self) -> Result<Vec<RegistryRunner>> {
        let mut runners = self.registry.list_runners().await?;
        runners.sort_by_key(|r| r.id);
        Ok(runners)
    }

    /// Registry runners carrying this environment's default prefix.
    pub async fn list_fleet_registered_runners(&self) -> Result<Vec<RegistryRunner>> {
        Ok(self
            .list_registry_runners()
            .await?
            .into_iter()
            .filter(|r| self.naming.matches(&r.name, RunnerType::Default))
            .collect())
    }

    pub async fn list_not_busy(&self) -> Result<Vec<RegistryRunner>> {
        Ok(self
            .list_fleet_registered_runners()
            .await?
            .into_iter()
            .filter(|r| !r.busy)
            .collect())
    }

    /// Not busy and not offline.
    pub async fn list_available(&self) -> Result<Vec<RegistryRunner>> {
        Ok(self
            .list_fleet_registered_runners()
            .await?
            .into_iter()
            .filter(RegistryRunner::is_available)
            .collect())
    }

    pub async fn list_offline(&self) -> Result<Vec<RegistryRunner>> {
        Ok(self
            .list_fleet_registered_runners()
            .await?
            .into_iter()
            .filter(|r| r.status == RunnerStatus::Offline)
            .collect())
    }

    /// Returns true if a ghost runner of this environment is registered.
    pub async fn ghost_exists(&self) -> Result<bool> {
        Ok(self
            .list_registry_runners()
            .await?
            .iter()
            .any(|r| self.naming.matches(&r.name, RunnerType::Ghost)))
    }

    pub async fn runner_by_name(&self, name: &str) -> Result<Option<RegistryRunner>> {
        Ok(self
            .list_registry_runners()
            .await?
            .into_iter()
            .find(|r| r.name == name))
    }

    /// Returns true if the registry reports `name` with `status`. Unknown
    /// runners are not ready, not an error.
    pub async fn status_matches(&self, name: &str, status: RunnerStatus) -> Result<bool> {
        let matches = match self.runner_by_name(name).await? {
            Some(runner) => runner.status == status,
            None => {
                debug!(name = %name, "Runner registry status is unknown");
                false
            }
        };
        Ok(matches)
    }

    /// The fused view of this environment's runners.
    ///
    /// Registry runners come first in registry id order, followed by
    /// VMs the registry does not know. With `min_age`, runners whose VM is
    /// younger are left out entirely.
    pub async fn list_runners(&self, min_age: Option<Duration>) -> Result<Vec<Runner>> {
        let (fleet, registry) = tokio::try_join!(
            self.fleet_runners(min_age.is_some()),
            self.list_registry_runners()
        )?;

        let now = Utc::now();
        let old_enough = |r: &FleetRunner| match min_age {
            Some(min_age) => r.age(now).is_some_and(|age| age >= min_age),
            None => true,
        };

        let all_vm_names: HashSet<String> = fleet.iter().map(|r| r.name.clone()).collect();
        let mut by_name: HashMap<String, FleetRunner> = HashMap::new();
        let mut fleet_order = Vec::new();
        for runner in fleet.into_iter().filter(|r| old_enough(r)) {
            fleet_order.push(runner.name.clone());
            by_name.insert(runner.name.clone(), runner);
        }

        let mut runners = Vec::new();
        for registry in registry
            .into_iter()
            .filter(|r| self.naming.classify(&r.name).is_some())
        {
            match by_name.remove(&registry.name) {
                Some(fleet) => runners.push(Runner::Fused { fleet, registry }),
                // The VM exists but is too young.
                None if all_vm_names.contains(&registry.name) => {}
                None => runners.push(Runner::RegistryOnly(registry)),
            }
        }
        runners.extend(
            fleet_order
                .into_iter()
                .filter_map(|name| by_name.remove(&name))
                .map(Runner::FleetOnly),
        );

        Ok(runners)
    }

    /// VMs older than `max_age` that never registered. These are left
    /// behind by provisioning timeouts.
    pub async fn list_stale_unregistered(&self, max_age: Duration) -> Result<Vec<FleetRunner>> {
        Ok(self
            .list_runners(Some(max_age))
            .await?
            .into_iter()
            .filter_map(|runner| match runner {
                Runner::FleetOnly(fleet) => Some(fleet),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::MockFleet;
    use crate::registry::MockRegistry;

    fn setup() -> (Arc<MockFleet>, Arc<MockRegistry>, RunnerInventory) {
        let fleet = Arc::new(MockFleet::new());
        let registry = Arc::new(MockRegistry::new());
        let inventory = RunnerInventory::new(
            fleet.clone(),
            registry.clone(),
            RunnerNaming::new("prod").unwrap(),
        );
        (fleet, registry, inventory)
    }

    fn hours_ago(h: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(h)
    }

    const PROD: &[(&str, &str)] = &[("env", "prod"), ("type", "default")];

    #[tokio::test]
    async fn test_status_matches_unknown_is_false() {
        let (_, registry, inventory) = setup();
        registry.register("vm-gcp-prod-a", RunnerStatus::Online, false);

        assert!(inventory
            .status_matches("vm-gcp-prod-a", RunnerStatus::Online)
            .await
            .unwrap());
        assert!(!inventory
            .status_matches("vm-gcp-prod-a", RunnerStatus::Offline)
            .await
            .unwrap());
        assert!(!inventory
            .status_matches("vm-gcp-prod-missing", RunnerStatus::Online)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_status_change_is_seen_by_next_read() {
        let (_, registry, inventory) = setup();
        registry.register("vm-gcp-prod-a", RunnerStatus::Offline, false);
        assert!(inventory.list_available().await.unwrap().is_empty());

        registry.set_status("vm-gcp-prod-a", RunnerStatus::Online);
        assert!(inventory
            .status_matches("vm-gcp-prod-a", RunnerStatus::Online)
            .await
            .unwrap());
        assert_eq!(inventory.list_available().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registry_filters() {
        let (_, registry, inventory) = setup();
        registry.register("vm-gcp-prod-idle", RunnerStatus::Online, false);
        registry.register("vm-gcp-prod-busy", RunnerStatus::Online, true);
        registry.register("vm-gcp-prod-dead", RunnerStatus::Offline, false);
        registry.register("vm-gcp-production-x", RunnerStatus::Online, false);
        registry.register("vm-gcp-ghost-prod-g", RunnerStatus::Offline, false);
        registry.register("laptop", RunnerStatus::Online, false);

        let names = |runners: Vec<RegistryRunner>| -> Vec<String> {
            runners.into_iter().map(|r| r.name).collect()
        };

        assert_eq!(
            names(inventory.list_fleet_registered_runners().await.unwrap()),
            ["vm-gcp-prod-idle", "vm-gcp-prod-busy", "vm-gcp-prod-dead"]
        );
        assert_eq!(
            names(inventory.list_not_busy().await.unwrap()),
            ["vm-gcp-prod-idle", "vm-gcp-prod-dead"]
        );
        assert_eq!(
            names(inventory.list_available().await.unwrap()),
            ["vm-gcp-prod-idle"]
        );
        assert_eq!(
            names(inventory.list_offline().await.unwrap()),
            ["vm-gcp-prod-dead"]
        );
        assert!(inventory.ghost_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_list_fleet_runners_min_age_inclusive_filter() {
        let (fleet, _, inventory) = setup();
        fleet.insert_vm("vm-gcp-prod-old", PROD, hours_ago(3));
        fleet.insert_vm("vm-gcp-prod-new", PROD, Utc::now());
        fleet.insert_vm("vm-gcp-dev-old", &[("env", "dev")], hours_ago(3));

        let all = inventory.list_fleet_runners(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.created_at.is_none()));

        let aged = inventory
            .list_fleet_runners(Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].name, "vm-gcp-prod-old");
        assert_eq!(aged[0].runner_type, Some(RunnerType::Default));

        let everything = inventory
            .list_fleet_runners(Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_failure_aborts_aged_listing() {
        let (fleet, _, inventory) = setup();
        fleet.insert_vm("vm-gcp-prod-a", PROD, hours_ago(3));
        fleet.fail_metadata("vm-gcp-prod-a");

        assert!(inventory
            .list_fleet_runners(Some(Duration::from_secs(60)))
            .await
            .is_err());
        // Without an age filter no metadata is needed.
        assert_eq!(inventory.list_fleet_runners(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_vm_is_dropped_from_aged_listings() {
        let (fleet, registry, inventory) = setup();
        fleet.insert_vm("vm-gcp-prod-a", PROD, hours_ago(3));
        fleet.insert_vm("vm-gcp-prod-gone", PROD, hours_ago(3));
        fleet.vanish_vm("vm-gcp-prod-gone");
        registry.register("vm-gcp-prod-a", RunnerStatus::Online, false);
        registry.register("vm-gcp-prod-gone", RunnerStatus::Offline, false);

        let aged = inventory
            .list_fleet_runners(Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let names: Vec<_> = aged.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["vm-gcp-prod-a"]);

        // The registry entry of the vanished VM is still reported.
        let runners = inventory
            .list_runners(Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(runners.len(), 2);
        assert!(matches!(&runners[1], Runner::RegistryOnly(r) if r.name == "vm-gcp-prod-gone"));
    }

    #[tokio::test]
    async fn test_list_runners_fuses_by_name() {
        let (fleet, registry, inventory) = setup();
        fleet.insert_vm("vm-gcp-prod-both", PROD, hours_ago(2));
        fleet.insert_vm("vm-gcp-prod-booting", PROD, hours_ago(2));
        registry.register("vm-gcp-prod-both", RunnerStatus::Online, false);
        registry.register("vm-gcp-prod-gone", RunnerStatus::Offline, false);
        registry.register("someone-else", RunnerStatus::Online, false);

        let runners = inventory.list_runners(None).await.unwrap();
        assert_eq!(runners.len(), 3);
        assert!(matches!(&runners[0], Runner::Fused { registry, .. } if registry.name == "vm-gcp-prod-both"));
        assert!(matches!(&runners[1], Runner::RegistryOnly(r) if r.name == "vm-gcp-prod-gone"));
        assert!(matches!(&runners[2], Runner::FleetOnly(f) if f.name == "vm-gcp-prod-booting"));

        assert!(runners[0].is_idle());
        assert!(!runners[1].is_idle());
        assert!(runners[2].registry().is_none());
    }

    #[tokio::test]
    async fn test_list_runners_with_min_age_drops_young_vms() {
        let (fleet, registry, inventory) = setup();
        fleet.insert_vm("vm-gcp-prod-young", PROD, Utc::now());
        fleet.insert_vm("vm-gcp-prod-old", PROD, hours_ago(2));
        registry.register("vm-gcp-prod-young", RunnerStatus::Online, false);
        registry.register("vm-gcp-prod-old", RunnerStatus::Online, false);

        let runners = inventory
            .list_runners(Some(Duration::from_secs(600)))
            .await
            .unwrap();
        let names: Vec<_> = runners.iter().map(Runner::name).collect();
        assert_eq!(names, ["vm-gcp-prod-old"]);
    }

    #[tokio::test]
    async fn test_stale_unregistered() {
        let (fleet, registry, inventory) = setup();
        fleet.insert_vm("vm-gcp-prod-stale", PROD, hours_ago(5));
        fleet.insert_vm("vm-gcp-prod-fresh", PROD, Utc::now());
        fleet.insert_vm("vm-gcp-prod-ok", PROD, hours_ago(5));
        registry.register("vm-gcp-prod-ok", RunnerStatus::Online, true);

        let stale = inventory
            .list_stale_unregistered(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "vm-gcp-prod-stale");
    }

    #[tokio::test]
    async fn test_transient_registry_error_propagates() {
        let (_, registry, inventory) = setup();
        registry.set_unavailable(true);
        let err = inventory.list_available().await.unwrap_err();
        assert!(err.is_transient());
    }
}
