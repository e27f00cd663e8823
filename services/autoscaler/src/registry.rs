//! CI runner registry client.
//!
//! The registry is reached through an RPC proxy: every call is a POST of
//! `{scope, function, params}` to a single URL, authenticated with an
//! identity token for that URL. The proxy returns the CI API's response
//! payload as JSON.
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::auth::TokenSource;
use crate::error::{Error, Result, Service};

/// Page size for runner listings.
const RUNNERS_PER_PAGE: usize = 100;

/// A self-hosted runner as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRunner {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub os: Option<String>,
    pub status: RunnerStatus,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<RunnerLabel>,
}

impl RegistryRunner {
    /// Returns true if the runner is neither busy nor offline.
    pub fn is_available(&self) -> bool {
        !self.busy && self.status == RunnerStatus::Online
    }
}

/// A label attached to a registered runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerLabel {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Connection status of a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Online,
    Offline,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Online => write!(f, "online"),
            RunnerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// The pending job a scale-up was triggered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub owner: String,
    pub repo: String,
    pub check_run_id: u64,
}

/// A check run (the registry's view of a job).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub status: CheckRunStatus,
}

/// Status of a check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunStatus {
    Queued,
    InProgress,
    Completed,
    #[serde(other)]
    Other,
}

impl CheckRunStatus {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// The CI runner registry.
///
/// Listings are returned sorted ascending by registry id.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// List every self-hosted runner of the organization.
    async fn list_runners(&self) -> Result<Vec<RegistryRunner>>;

    /// Create a one-time registration token.
    async fn create_registration_token(&self) -> Result<String>;

    /// Create a token a runner uses to unregister itself.
    async fn create_remove_token(&self) -> Result<String>;

    /// Unregister a runner.
    async fn delete_runner(&self, id: u64) -> Result<()>;

    /// Fetch the check run a scale-up is waiting on.
    async fn get_check_run(&self, job: &JobContext) -> Result<CheckRun>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    scope: &'a str,
    function: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RunnerPage {
    #[serde(default)]
    total_count: Option<usize>,
    runners: Vec<RegistryRunner>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Registry client speaking to the RPC proxy.
pub struct RegistryClient {
    client: reqwest::Client,
    url: String,
    org: String,
    tokens: Arc<dyn TokenSource>,
}

impl RegistryClient {
    /// Create a client for the proxy at `url`, managing runners of `org`.
    pub fn new(
        url: impl Into<String>,
        org: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::transport(Service::Registry, e))?;

        Ok(Self {
            client,
            url: url.into(),
            org: org.into(),
            tokens,
        })
    }

    async fn send(
        &self,
        scope: &str,
        function: &str,
        params: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.identity_token(&self.url).await?;
        debug!(scope = %scope, function = %function, "Calling registry");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(&RpcRequest {
                scope,
                function,
                params,
            })
            .send()
            .await
            .map_err(|e| Error::transport(Service::Registry, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, function = %function, "Registry call failed");
            return Err(Error::http(Service::Registry, status, body));
        }

        Ok(response)
    }

    /// Call a registry function and decode its payload.
    async fn call<T: DeserializeOwned>(
        &self,
        scope: &str,
        function: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        self.send(scope, function, params)
            .await?
            .json()
            .await
            .map_err(|e| Error::transport(Service::Registry, e))
    }
}

#[async_trait]
impl RunnerRegistry for RegistryClient {
    async fn list_runners(&self) -> Result<Vec<RegistryRunner>> {
        let mut runners = Vec::new();
        let mut page_number = 1;

        loop {
            let page: RunnerPage = self
                .call(
                    "actions",
                    "listSelfHostedRunnersForOrg",
                    serde_json::json!({
                        "org": self.org,
                        "per_page": RUNNERS_PER_PAGE,
                        "page": page_number,
                    }),
                )
                .await?;

            let fetched = page.runners.len();
            runners.extend(page.runners);

            let complete = match page.total_count {
                Some(total) => runners.len() >= total,
                None => fetched < RUNNERS_PER_PAGE,
            };
            if complete || fetched == 0 {
                break;
            }
            page_number += 1;
        }

        runners.sort_by_key(|r| r.id);
        debug!(count = runners.len(), "Listed registry runners");
        Ok(runners)
    }

    async fn create_registration_token(&self) -> Result<String> {
        let token: TokenResponse = self
            .call(
                "actions",
                "createRegistrationTokenForOrg",
                serde_json::json!({ "org": self.org }),
            )
            .await?;
        Ok(token.token)
    }

    async fn create_remove_token(&self) -> Result<String> {
        let token: TokenResponse = self
            .call(
                "actions",
                "createRemoveTokenForOrg",
                serde_json::json!({ "org": self.org }),
            )
            .await?;
        Ok(token.token)
    }

    async fn delete_runner(&self, id: u64) -> Result<()> {
        self.send(
            "actions",
            "deleteSelfHostedRunnerFromOrg",
            serde_json::json!({ "org": self.org, "runner_id": id }),
        )
        .await?;
        info!(runner_id = id, "Runner unregistered");
        Ok(())
    }

    async fn get_check_run(&self, job: &JobContext) -> Result<CheckRun> {
        self.call(
            "checks",
            "get",
            serde_json::json!({
                "owner": job.owner,
                "repo": job.repo,
                "check_run_id": job.check_run_id,
            }),
        )
        .await
    }
}

#[derive(Default)]
struct MockRegistryState {
    runners: BTreeMap<u64, RegistryRunner>,
    check_runs: HashMap<u64, VecDeque<CheckRunStatus>>,
    check_run_calls: HashMap<u64, u32>,
    failing_deletes: HashSet<u64>,
    deleted: Vec<u64>,
    unavailable: bool,
}

/// Mock registry for testing and development.
pub struct MockRegistry {
    state: Mutex<MockRegistryState>,
    next_id: AtomicU64,
    tokens_issued: AtomicU32,
}

impl MockRegistry {
    /// Create an empty mock registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockRegistryState::default()),
            next_id: AtomicU64::new(1),
            tokens_issued: AtomicU32::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockRegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.state().unavailable {
            return Err(Error::api(Service::Registry, "mock registry unavailable"));
        }
        Ok(())
    }

    /// Register a runner; returns its id. Ids increase with each call.
    pub fn register(&self, name: &str, status: RunnerStatus, busy: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state().runners.insert(
            id,
            RegistryRunner {
                id,
                name: name.to_string(),
                os: Some("linux".to_string()),
                status,
                busy,
                labels: vec![],
            },
        );
        id
    }

    pub fn set_status(&self, name: &str, status: RunnerStatus) {
        for runner in self.state().runners.values_mut() {
            if runner.name == name {
                runner.status = status;
            }
        }
    }

    pub fn set_busy(&self, name: &str, busy: bool) {
        for runner in self.state().runners.values_mut() {
            if runner.name == name {
                runner.busy = busy;
            }
        }
    }

    /// Make every call fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Make deletes of this runner id fail.
    pub fn fail_delete(&self, id: u64) {
        self.state().failing_deletes.insert(id);
    }

    /// Script the statuses returned for a check run, one per call. The
    /// last status repeats.
    pub fn script_check_run(&self, id: u64, statuses: Vec<CheckRunStatus>) {
        self.state().check_runs.insert(id, statuses.into());
    }

    /// Number of times a check run was fetched.
    pub fn check_run_calls(&self, id: u64) -> u32 {
        self.state().check_run_calls.get(&id).copied().unwrap_or(0)
    }

    /// Registered runners, ascending by id.
    pub fn runners(&self) -> Vec<RegistryRunner> {
        self.state().runners.values().cloned().collect()
    }

    /// Ids unregistered so far, in call order.
    pub fn deleted(&self) -> Vec<u64> {
        self.state().deleted.clone()
    }

    pub fn tokens_issued(&self) -> u32 {
        self.tokens_issued.load(Ordering::SeqCst)
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerRegistry for MockRegistry {
    async fn list_runners(&self) -> Result<Vec<RegistryRunner>> {
        self.check_available()?;
        Ok(self.runners())
    }

    async fn create_registration_token(&self) -> Result<String> {
        self.check_available()?;
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!("[MOCK] registration-{n}"))
    }

    async fn create_remove_token(&self) -> Result<String> {
        self.check_available()?;
        Ok("[MOCK] remove".to_string())
    }

    async fn delete_runner(&self, id: u64) -> Result<()> {
        self.check_available()?;
        let mut state = self.state();
        if state.failing_deletes.contains(&id) {
            return Err(Error::api(
                Service::Registry,
                format!("mock delete failure for runner {id}"),
            ));
        }
        state.runners.remove(&id);
        state.deleted.push(id);
        debug!(runner_id = id, "[MOCK] Runner unregistered");
        Ok(())
    }

    async fn get_check_run(&self, job: &JobContext) -> Result<CheckRun> {
        self.check_available()?;
        let mut state = self.state();
        *state.check_run_calls.entry(job.check_run_id).or_default() += 1;

        let status = match state.check_runs.get_mut(&job.check_run_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(CheckRunStatus::Queued),
            Some(queue) => queue.front().copied().unwrap_or(CheckRunStatus::Queued),
            None => CheckRunStatus::Queued,
        };

        Ok(CheckRun {
            id: job.check_run_id,
            name: None,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RegistryClient {
        RegistryClient::new(
            server.uri(),
            "acme",
            Arc::new(StaticTokenSource::new("id-token")),
        )
        .unwrap()
    }

    fn runner_json(id: u64, name: &str, status: &str, busy: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "os": "linux",
            "status": status,
            "busy": busy,
            "labels": [{ "id": 1, "name": "self-hosted", "type": "read-only" }]
        })
    }

    #[tokio::test]
    async fn test_list_runners_sorted_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer id-token"))
            .and(body_partial_json(serde_json::json!({
                "scope": "actions",
                "function": "listSelfHostedRunnersForOrg",
                "params": { "org": "acme" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "runners": [
                    runner_json(9, "vm-gcp-prod-b", "online", true),
                    runner_json(3, "vm-gcp-prod-a", "offline", false),
                ]
            })))
            .mount(&server)
            .await;

        let runners = client(&server).list_runners().await.unwrap();
        assert_eq!(runners.len(), 2);
        assert_eq!(runners[0].id, 3);
        assert_eq!(runners[0].status, RunnerStatus::Offline);
        assert_eq!(runners[1].name, "vm-gcp-prod-b");
        assert!(runners[1].busy);
        assert_eq!(runners[1].labels[0].name, "self-hosted");
    }

    #[tokio::test]
    async fn test_list_runners_follows_pages() {
        let server = MockServer::start().await;
        let first: Vec<_> = (1..=100)
            .map(|i| runner_json(i, &format!("vm-gcp-prod-{i}"), "online", false))
            .collect();

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "params": { "page": 1 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 101,
                "runners": first
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "params": { "page": 2 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 101,
                "runners": [runner_json(101, "vm-gcp-prod-101", "online", false)]
            })))
            .mount(&server)
            .await;

        let runners = client(&server).list_runners().await.unwrap();
        assert_eq!(runners.len(), 101);
    }

    #[tokio::test]
    async fn test_registration_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "function": "createRegistrationTokenForOrg"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "AABBCC",
                "expires_at": "2024-05-06T10:00:00Z"
            })))
            .mount(&server)
            .await;

        assert_eq!(
            client(&server).create_registration_token().await.unwrap(),
            "AABBCC"
        );
    }

    #[tokio::test]
    async fn test_delete_runner_accepts_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "function": "deleteSelfHostedRunnerFromOrg",
                "params": { "org": "acme", "runner_id": 42 }
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).delete_runner(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_run_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "scope": "checks",
                "function": "get",
                "params": { "owner": "acme", "repo": "app", "check_run_id": 77 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 77,
                "name": "build",
                "status": "queued",
                "conclusion": null
            })))
            .mount(&server)
            .await;

        let job = JobContext {
            owner: "acme".to_string(),
            repo: "app".to_string(),
            check_run_id: 77,
        };
        let run = client(&server).get_check_run(&job).await.unwrap();
        assert!(run.status.is_queued());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = client(&server).list_runners().await.unwrap_err();
        match err {
            Error::TransientApi {
                service, status, ..
            } => {
                assert_eq!(service, Service::Registry);
                assert_eq!(status, Some(502));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_check_run_status() {
        let status: CheckRunStatus = serde_json::from_str("\"waiting\"").unwrap();
        assert_eq!(status, CheckRunStatus::Other);
    }

    #[tokio::test]
    async fn test_mock_registry_scripted_check_run() {
        let registry = MockRegistry::new();
        registry.script_check_run(5, vec![CheckRunStatus::Queued, CheckRunStatus::InProgress]);
        let job = JobContext {
            owner: "o".to_string(),
            repo: "r".to_string(),
            check_run_id: 5,
        };

        assert!(registry.get_check_run(&job).await.unwrap().status.is_queued());
        assert_eq!(
            registry.get_check_run(&job).await.unwrap().status,
            CheckRunStatus::InProgress
        );
        assert_eq!(
            registry.get_check_run(&job).await.unwrap().status,
            CheckRunStatus::InProgress
        );
        assert_eq!(registry.check_run_calls(5), 3);
    }
}
