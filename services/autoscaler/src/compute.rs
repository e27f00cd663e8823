//! Compute Engine REST client.
//!
//! Implements [`Fleet`] on top of the `instances` collection of one zone:
//! `insert` to create, `get` to read metadata and poll state, and `list`
//! (with a label filter and page tokens) to enumerate runner VMs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::auth::TokenSource;
use crate::error::{Error, Result, Service};
use crate::fleet::{Fleet, Vm, VmConfig, VmMetadata, VmStatus};

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Default interval between instance state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: String,
    status: VmStatus,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    creation_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Compute Engine client for one project and zone.
pub struct ComputeClient {
    client: reqwest::Client,
    base_url: String,
    project: String,
    zone: String,
    tokens: Arc<dyn TokenSource>,
    poll_interval: Duration,
}

impl ComputeClient {
    /// Create a client. `base_url` is normally
    /// `https://compute.googleapis.com/compute/v1`.
    pub fn new(
        base_url: impl Into<String>,
        project: impl Into<String>,
        zone: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::transport(Service::Fleet, e))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            zone: zone.into(),
            tokens,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the state poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn instances_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances",
            self.base_url, self.project, self.zone
        )
    }

    /// Request body for `instances.insert`.
    fn insert_body(&self, name: &str, config: &VmConfig) -> serde_json::Value {
        let metadata_items: Vec<_> = config
            .metadata
            .iter()
            .map(|(key, value)| serde_json::json!({ "key": key, "value": value }))
            .collect();

        let mut body = serde_json::json!({
            "name": name,
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, config.machine_type),
            "labels": config.labels,
            "scheduling": {
                "automaticRestart": false,
                "preemptible": config.preemptible,
            },
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": format!("global/images/{}", config.image),
                },
            }],
            "networkInterfaces": [{
                "network": format!("global/networks/{}", config.network),
                "accessConfigs": [],
            }],
            "metadata": { "items": metadata_items },
        });

        if let Some(email) = &config.service_account {
            body["serviceAccounts"] = serde_json::json!([{
                "email": email,
                "scopes": [CLOUD_PLATFORM_SCOPE],
            }]);
        }

        body
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/{}", self.instances_url(), name);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::transport(Service::Fleet, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, name = %name, "Failed to get instance");
            return Err(Error::http(Service::Fleet, status, body));
        }

        let instance = response
            .json()
            .await
            .map_err(|e| Error::transport(Service::Fleet, e))?;
        Ok(Some(instance))
    }
}

fn to_vm(instance: Instance) -> Vm {
    Vm {
        name: instance.name,
        status: instance.status,
        labels: instance.labels,
    }
}

#[async_trait]
impl Fleet for ComputeClient {
    async fn create_vm(&self, name: &str, config: &VmConfig) -> Result<Vm> {
        let token = self.tokens.access_token().await?;
        info!(
            name = %name,
            machine_type = %config.machine_type,
            image = %config.image,
            preemptible = config.preemptible,
            "Creating runner VM"
        );

        let response = self
            .client
            .post(self.instances_url())
            .bearer_auth(token)
            .json(&self.insert_body(name, config))
            .send()
            .await
            .map_err(|e| Error::transport(Service::Fleet, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, name = %name, "Failed to create VM");
            return Err(Error::http(Service::Fleet, status, body));
        }

        // The response is a zone operation; the instance shows up once it
        // has been accepted.
        Ok(Vm {
            name: name.to_string(),
            status: VmStatus::Provisioning,
            labels: config.labels.clone(),
        })
    }

    async fn wait_for_state(&self, name: &str, status: VmStatus, timeout: Duration) -> Result<()> {
        let poll = async {
            loop {
                match self.get_instance(name).await? {
                    Some(instance) if instance.status == status => return Ok(()),
                    Some(instance) => {
                        debug!(name = %name, current = %instance.status, target = %status, "VM not ready");
                    }
                    None => debug!(name = %name, "VM not visible yet"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProvisionTimeout {
                name: name.to_string(),
                expected: status.to_string(),
                timeout,
            }),
        }
    }

    async fn list_vms(&self, filter: &str) -> Result<Vec<Vm>> {
        let mut vms = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.tokens.access_token().await?;
            let mut request = self
                .client
                .get(self.instances_url())
                .bearer_auth(token)
                .query(&[("filter", filter)]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::transport(Service::Fleet, e))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "Failed to list VMs");
                return Err(Error::http(Service::Fleet, status, body));
            }

            let page: InstanceList = response
                .json()
                .await
                .map_err(|e| Error::transport(Service::Fleet, e))?;
            vms.extend(page.items.into_iter().map(to_vm));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(filter = %filter, count = vms.len(), "Listed VMs");
        Ok(vms)
    }

    async fn get_vm_metadata(&self, name: &str) -> Result<Option<VmMetadata>> {
        let Some(instance) = self.get_instance(name).await? else {
            debug!(name = %name, "VM not found");
            return Ok(None);
        };

        let raw = instance.creation_timestamp.as_deref().ok_or_else(|| {
            Error::api(Service::Fleet, format!("VM {name} has no creation timestamp"))
        })?;
        let creation_timestamp = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| {
                Error::api(
                    Service::Fleet,
                    format!("VM {name} has an invalid creation timestamp '{raw}': {e}"),
                )
            })?
            .with_timezone(&Utc);

        Ok(Some(VmMetadata {
            name: instance.name,
            status: instance.status,
            creation_timestamp,
            labels: instance.labels,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INSTANCES: &str = "/projects/ci-project/zones/europe-west1-b/instances";

    fn client(server: &MockServer) -> ComputeClient {
        ComputeClient::new(
            server.uri(),
            "ci-project",
            "europe-west1-b",
            Arc::new(StaticTokenSource::new("access")),
        )
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
    }

    fn config() -> VmConfig {
        VmConfig {
            machine_type: "e2-standard-4".to_string(),
            image: "runner-2024".to_string(),
            network: "ci".to_string(),
            preemptible: true,
            service_account: Some("runner@ci-project.iam.gserviceaccount.com".to_string()),
            labels: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("type".to_string(), "default".to_string()),
            ]),
            metadata: BTreeMap::from([("registration-token".to_string(), "AABB".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_insert_body() {
        let server = MockServer::start().await;
        let body = client(&server).insert_body("vm-gcp-prod-x", &config());

        assert_eq!(body["machineType"], "zones/europe-west1-b/machineTypes/e2-standard-4");
        assert_eq!(body["disks"][0]["initializeParams"]["sourceImage"], "global/images/runner-2024");
        assert_eq!(body["networkInterfaces"][0]["network"], "global/networks/ci");
        assert_eq!(body["scheduling"]["preemptible"], true);
        assert_eq!(body["labels"]["env"], "prod");
        assert_eq!(body["metadata"]["items"][0]["key"], "registration-token");
        assert_eq!(body["serviceAccounts"][0]["scopes"][0], CLOUD_PLATFORM_SCOPE);
    }

    #[tokio::test]
    async fn test_create_vm_posts_insert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INSTANCES))
            .and(header("authorization", "Bearer access"))
            .and(body_partial_json(serde_json::json!({ "name": "vm-gcp-prod-x" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "compute#operation",
                "status": "RUNNING"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vm = client(&server)
            .create_vm("vm-gcp-prod-x", &config())
            .await
            .unwrap();
        assert_eq!(vm.status, VmStatus::Provisioning);
    }

    #[tokio::test]
    async fn test_list_vms_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCES))
            .and(query_param("filter", "labels.env=prod"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "vm-b", "status": "STAGING" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(INSTANCES))
            .and(query_param("filter", "labels.env=prod"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "vm-a", "status": "RUNNING", "labels": { "env": "prod" } }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let vms = client(&server).list_vms("labels.env=prod").await.unwrap();
        let names: Vec<_> = vms.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, ["vm-a", "vm-b"]);
        assert_eq!(vms[1].status, VmStatus::Staging);
    }

    #[tokio::test]
    async fn test_empty_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCES))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "compute#instanceList"
            })))
            .mount(&server)
            .await;

        assert!(client(&server).list_vms("labels.env=prod").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_parses_offset_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{INSTANCES}/vm-a")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "vm-a",
                "status": "RUNNING",
                "creationTimestamp": "2024-05-06T01:02:03.000-07:00"
            })))
            .mount(&server)
            .await;

        let metadata = client(&server)
            .get_vm_metadata("vm-a")
            .await
            .unwrap()
            .expect("VM exists");
        assert_eq!(
            metadata.creation_timestamp,
            Utc.with_ymd_and_hms(2024, 5, 6, 8, 2, 3).unwrap()
        );
    }

    #[tokio::test]
    async fn test_metadata_of_deleted_vm_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{INSTANCES}/vm-gone")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client(&server)
            .get_vm_metadata("vm-gone")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_wait_for_state_polls_until_running() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{INSTANCES}/vm-a")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "vm-a",
                "status": "PROVISIONING"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{INSTANCES}/vm-a")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "vm-a",
                "status": "RUNNING"
            })))
            .mount(&server)
            .await;

        client(&server)
            .wait_for_state("vm-a", VmStatus::Running, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{INSTANCES}/vm-a")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .wait_for_state("vm-a", VmStatus::Running, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_provision_timeout());
    }

    #[tokio::test]
    async fn test_auth_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthenticated"))
            .mount(&server)
            .await;

        let err = client(&server).list_vms("labels.env=prod").await.unwrap_err();
        assert!(err.is_transient());
    }
}
