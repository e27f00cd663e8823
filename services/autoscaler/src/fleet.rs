//! Compute fleet interface and mock implementation.
//!
//! The fleet interface abstracts the VM operations the autoscaler needs:
//! - Creating a runner VM and waiting for it to run
//! - Listing the VMs of an environment
//! - Reading per-VM metadata (creation time)
//!
//! VMs are never deleted through this interface; a runner VM powers itself
//! off from its shutdown script once unregistered.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result, Service};

/// Lifecycle status of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Repairing,
    Terminated,
    #[serde(other)]
    Other,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Provisioning => "PROVISIONING",
            VmStatus::Staging => "STAGING",
            VmStatus::Running => "RUNNING",
            VmStatus::Stopping => "STOPPING",
            VmStatus::Suspending => "SUSPENDING",
            VmStatus::Suspended => "SUSPENDED",
            VmStatus::Repairing => "REPAIRING",
            VmStatus::Terminated => "TERMINATED",
            VmStatus::Other => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// A VM as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    pub name: String,
    pub status: VmStatus,
    pub labels: BTreeMap<String, String>,
}

/// Per-VM metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMetadata {
    pub name: String,
    pub status: VmStatus,
    pub creation_timestamp: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

impl VmMetadata {
    /// Age of the VM at `now`. Clock skew yields zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.creation_timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Settings for a new runner VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub machine_type: String,
    /// Source image name.
    pub image: String,
    /// Network name.
    pub network: String,
    pub preemptible: bool,
    pub service_account: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Instance metadata items, including the registration token.
    pub metadata: BTreeMap<String, String>,
}

/// Listing filter selecting the VMs of an environment.
pub fn env_filter(env: &str) -> String {
    format!("labels.env={env}")
}

/// Compute fleet interface.
#[async_trait]
pub trait Fleet: Send + Sync {
    /// Create a VM.
    async fn create_vm(&self, name: &str, config: &VmConfig) -> Result<Vm>;

    /// Wait until a VM reaches `status`, failing with
    /// `Error::ProvisionTimeout` after `timeout`.
    async fn wait_for_state(&self, name: &str, status: VmStatus, timeout: Duration) -> Result<()>;

    /// List VMs matching a filter such as `labels.env=prod`.
    async fn list_vms(&self, filter: &str) -> Result<Vec<Vm>>;

    /// Fetch a VM's metadata, or `None` if the VM no longer exists.
    async fn get_vm_metadata(&self, name: &str) -> Result<Option<VmMetadata>>;
}

type CreateHook = Box<dyn Fn(&str, &VmConfig) + Send + Sync>;

struct MockVm {
    metadata: VmMetadata,
    config: Option<VmConfig>,
}

#[derive(Default)]
struct MockFleetState {
    vms: BTreeMap<String, MockVm>,
    metadata_failures: HashSet<String>,
    vanished: HashSet<String>,
}

/// Mock fleet for testing and development.
///
/// Created VMs are immediately `RUNNING` unless the fleet is configured to
/// leave them provisioning.
pub struct MockFleet {
    state: Mutex<MockFleetState>,
    create_calls: AtomicU32,
    fail_creates: bool,
    stuck_provisioning: bool,
    on_create: Option<CreateHook>,
}

impl MockFleet {
    /// Create an empty mock fleet.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockFleetState::default()),
            create_calls: AtomicU32::new(0),
            fail_creates: false,
            stuck_provisioning: false,
            on_create: None,
        }
    }

    /// Create a mock fleet that fails all creates.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new()
        }
    }

    /// Create a mock fleet whose VMs never leave `PROVISIONING`.
    pub fn stuck() -> Self {
        Self {
            stuck_provisioning: true,
            ..Self::new()
        }
    }

    /// Run `hook` after every successful create.
    pub fn on_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &VmConfig) + Send + Sync + 'static,
    {
        self.on_create = Some(Box::new(hook));
        self
    }

    fn state(&self) -> MutexGuard<'_, MockFleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an existing VM.
    pub fn insert_vm(&self, name: &str, labels: &[(&str, &str)], created_at: DateTime<Utc>) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state().vms.insert(
            name.to_string(),
            MockVm {
                metadata: VmMetadata {
                    name: name.to_string(),
                    status: VmStatus::Running,
                    creation_timestamp: created_at,
                    labels,
                },
                config: None,
            },
        );
    }

    /// Keep listing a VM but report it gone to metadata lookups, as for a
    /// VM that powered off between a listing and its metadata fetch.
    pub fn vanish_vm(&self, name: &str) {
        self.state().vanished.insert(name.to_string());
    }

    /// Make metadata fetches for this VM fail.
    pub fn fail_metadata(&self, name: &str) {
        self.state().metadata_failures.insert(name.to_string());
    }

    /// Names of all VMs.
    pub fn vm_names(&self) -> Vec<String> {
        self.state().vms.keys().cloned().collect()
    }

    /// Config a VM was created with.
    pub fn config_of(&self, name: &str) -> Option<VmConfig> {
        self.state().vms.get(name).and_then(|vm| vm.config.clone())
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockFleet {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter
        .trim()
        .strip_prefix("labels.")
        .and_then(|f| f.split_once('='))
    {
        Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
        None => true,
    }
}

#[async_trait]
impl Fleet for MockFleet {
    async fn create_vm(&self, name: &str, config: &VmConfig) -> Result<Vm> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates {
            return Err(Error::api(Service::Fleet, "mock fleet configured to fail"));
        }

        info!(
            name = %name,
            machine_type = %config.machine_type,
            image = %config.image,
            "[MOCK] Creating VM"
        );

        let status = if self.stuck_provisioning {
            VmStatus::Provisioning
        } else {
            VmStatus::Running
        };
        let metadata = VmMetadata {
            name: name.to_string(),
            status,
            creation_timestamp: Utc::now(),
            labels: config.labels.clone(),
        };
        self.state().vms.insert(
            name.to_string(),
            MockVm {
                metadata,
                config: Some(config.clone()),
            },
        );

        if let Some(hook) = &self.on_create {
            hook(name, config);
        }

        Ok(Vm {
            name: name.to_string(),
            status,
            labels: config.labels.clone(),
        })
    }

    async fn wait_for_state(&self, name: &str, status: VmStatus, timeout: Duration) -> Result<()> {
        let current = self.state().vms.get(name).map(|vm| vm.metadata.status);
        if current == Some(status) {
            return Ok(());
        }

        debug!(name = %name, current = ?current, target = %status, "[MOCK] Waiting for VM state");
        tokio::time::sleep(timeout).await;
        Err(Error::ProvisionTimeout {
            name: name.to_string(),
            expected: status.to_string(),
            timeout,
        })
    }

    async fn list_vms(&self, filter: &str) -> Result<Vec<Vm>> {
        Ok(self
            .state()
            .vms
            .values()
            .filter(|vm| matches_filter(&vm.metadata.labels, filter))
            .map(|vm| Vm {
                name: vm.metadata.name.clone(),
                status: vm.metadata.status,
                labels: vm.metadata.labels.clone(),
            })
            .collect())
    }

    async fn get_vm_metadata(&self, name: &str) -> Result<Option<VmMetadata>> {
        let state = self.state();
        if state.metadata_failures.contains(name) {
            return Err(Error::api(Service::Fleet, format!("metadata for {name} unavailable")));
        }
        if state.vanished.contains(name) {
            return Ok(None);
        }
        Ok(state.vms.get(name).map(|vm| vm.metadata.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(env: &str) -> VmConfig {
        VmConfig {
            machine_type: "e2-standard-2".to_string(),
            image: "runner-image".to_string(),
            network: "default".to_string(),
            preemptible: false,
            service_account: None,
            labels: BTreeMap::from([
                ("type".to_string(), "default".to_string()),
                ("env".to_string(), env.to_string()),
            ]),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_fleet_create_and_list() {
        let fleet = MockFleet::new();
        fleet
            .create_vm("vm-gcp-prod-a", &test_config("prod"))
            .await
            .unwrap();
        fleet
            .create_vm("vm-gcp-dev-b", &test_config("dev"))
            .await
            .unwrap();

        let vms = fleet.list_vms(&env_filter("prod")).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "vm-gcp-prod-a");
        assert_eq!(vms[0].status, VmStatus::Running);
        assert_eq!(fleet.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_fleet_failing() {
        let fleet = MockFleet::failing();
        let result = fleet.create_vm("vm-gcp-prod-a", &test_config("prod")).await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_fleet_stuck_times_out() {
        let fleet = MockFleet::stuck();
        fleet
            .create_vm("vm-gcp-prod-a", &test_config("prod"))
            .await
            .unwrap();

        let err = fleet
            .wait_for_state("vm-gcp-prod-a", VmStatus::Running, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(err.is_provision_timeout());
    }

    #[tokio::test]
    async fn test_mock_fleet_metadata_of_unknown_vm_is_none() {
        let fleet = MockFleet::new();
        fleet.insert_vm("vm-gcp-prod-a", &[("env", "prod")], Utc::now());
        fleet.vanish_vm("vm-gcp-prod-a");

        assert_eq!(fleet.list_vms(&env_filter("prod")).await.unwrap().len(), 1);
        assert!(fleet.get_vm_metadata("vm-gcp-prod-a").await.unwrap().is_none());
        assert!(fleet.get_vm_metadata("vm-gcp-prod-b").await.unwrap().is_none());
    }

    #[test]
    fn test_vm_age() {
        let created = Utc::now();
        let metadata = VmMetadata {
            name: "vm".to_string(),
            status: VmStatus::Running,
            creation_timestamp: created,
            labels: BTreeMap::new(),
        };
        assert_eq!(
            metadata.age(created + chrono::Duration::seconds(90)),
            Duration::from_secs(90)
        );
        assert_eq!(
            metadata.age(created - chrono::Duration::seconds(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_status_serde() {
        let status: VmStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(status, VmStatus::Running);
        let status: VmStatus = serde_json::from_str("\"PENDING_STOP\"").unwrap();
        assert_eq!(status, VmStatus::Other);
    }
}
