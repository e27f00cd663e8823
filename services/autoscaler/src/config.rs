//! Configuration for the autoscaler.
//!
//! Everything is read once per invocation from the process environment.
//! Variable names match the deployment contract of the runner VMs
//! (`GOOGLE_*`, `GITHUB_*`, `RUNNER_*`, `SCALE_*`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use runpool_id::RunnerNaming;
use runpool_reconcile::{DownRate, IdleSchedule, DEFAULT_MAX_LOOPS, DEFAULT_RETRY_WAIT};

use crate::executor::RunnerTemplate;
use crate::policy::PolicyConfig;

/// Autoscaler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Managed environment; runner VMs carry the label `env={env}`.
    pub env: String,

    /// Compute project.
    pub project: String,

    /// Compute zone runners are created in.
    pub zone: String,

    /// IANA timezone the idle schedule is evaluated in.
    pub timezone: String,

    /// URL of the CI registry RPC endpoint.
    pub registry_url: String,

    /// CI organization whose self-hosted runners are managed.
    pub github_org: String,

    /// Compute REST API base URL.
    pub compute_url: String,

    /// Metadata server base URL (credentials).
    pub metadata_url: String,

    /// Runner VM settings.
    pub runner: RunnerSettings,

    /// Scale policy settings.
    pub scale: ScaleSettings,

    /// Interval between periodic evaluations in `run` mode.
    pub tick_interval_secs: u64,

    /// TTL of the per-environment scale lease.
    pub lease_ttl_secs: u64,
}

/// Settings for the VMs that host runners.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub machine_type: String,
    pub image: String,
    pub network: String,
    pub preemptible: bool,
    pub service_account: Option<String>,
    /// Labels the runner registers with.
    pub labels: Option<String>,
    pub taint_labels: Option<String>,
    /// Endpoint the VM's shutdown script calls for a remove token.
    pub remove_token_url: Option<String>,
    pub startup_script: Option<PathBuf>,
    pub shutdown_script: Option<PathBuf>,
}

/// Raw scale policy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSettings {
    pub max_count: u32,
    pub up_rate: u32,
    /// Negative means unbounded.
    pub down_rate: i64,
    pub idle_count: u32,
    pub idle_schedule: Option<String>,
    pub min_age_secs: u64,
    /// Use the two-pass scale-down in `run` mode.
    pub smart_scale_down: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{key} must be set"))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let runner = RunnerSettings {
            machine_type: optional("RUNNER_MACHINE_TYPE")
                .unwrap_or_else(|| "e2-standard-2".to_string()),
            image: required("RUNNER_IMAGE")?,
            network: optional("RUNNER_NETWORK").unwrap_or_else(|| "default".to_string()),
            preemptible: optional("RUNNER_PREEMPTIBLE").is_some_and(|v| v == "true"),
            service_account: optional("RUNNER_SERVICE_ACCOUNT"),
            labels: optional("RUNNER_LABELS"),
            taint_labels: optional("RUNNER_TAINT_LABELS"),
            remove_token_url: optional("REMOVE_TOKEN_TRIGGER_URL"),
            startup_script: optional("RUNNER_STARTUP_SCRIPT").map(PathBuf::from),
            shutdown_script: optional("RUNNER_SHUTDOWN_SCRIPT").map(PathBuf::from),
        };

        let scale = ScaleSettings {
            max_count: parse_or(&lookup, "SCALE_UP_MAX", 10)?,
            up_rate: parse_or(&lookup, "SCALE_UP_RATE", 1)?,
            down_rate: parse_or(&lookup, "SCALE_DOWN_RATE", 1)?,
            idle_count: parse_or(&lookup, "SCALE_IDLE_COUNT", 0)?,
            idle_schedule: optional("SCALE_IDLE_SCHEDULE"),
            min_age_secs: parse_or(&lookup, "SCALE_MIN_AGE_SECONDS", 0)?,
            smart_scale_down: parse_or(&lookup, "SCALE_SMART_DOWN", true)?,
        };

        let config = Self {
            env: required("GOOGLE_ENV")?,
            project: required("GOOGLE_PROJECT")?,
            zone: required("GOOGLE_ZONE")?,
            timezone: optional("GOOGLE_TIMEZONE").unwrap_or_else(|| "UTC".to_string()),
            registry_url: required("GITHUB_API_TRIGGER_URL")?,
            github_org: required("GITHUB_ORG")?,
            compute_url: optional("RUNPOOL_COMPUTE_URL")
                .unwrap_or_else(|| "https://compute.googleapis.com/compute/v1".to_string()),
            metadata_url: optional("RUNPOOL_METADATA_URL").unwrap_or_else(|| {
                "http://metadata.google.internal/computeMetadata/v1".to_string()
            }),
            runner,
            scale,
            tick_interval_secs: parse_or(&lookup, "RUNPOOL_TICK_INTERVAL_SECS", 60)?,
            lease_ttl_secs: parse_or(&lookup, "RUNPOOL_LEASE_TTL_SECS", 600)?,
        };

        // Fail fast on values that are only used later.
        config.naming()?;
        config.policy()?;

        Ok(config)
    }

    /// Naming scheme for the managed environment.
    pub fn naming(&self) -> Result<RunnerNaming> {
        RunnerNaming::new(self.env.clone()).context("GOOGLE_ENV is not a valid runner name fragment")
    }

    /// Build the policy configuration.
    pub fn policy(&self) -> Result<PolicyConfig> {
        let idle_schedule = self
            .scale
            .idle_schedule
            .as_deref()
            .map(|expr| IdleSchedule::parse(expr, &self.timezone))
            .transpose()
            .context("SCALE_IDLE_SCHEDULE / GOOGLE_TIMEZONE are invalid")?;

        Ok(PolicyConfig {
            max_count: self.scale.max_count,
            up_rate: self.scale.up_rate,
            down_rate: DownRate::from(self.scale.down_rate),
            idle_count: self.scale.idle_count,
            idle_schedule,
            min_age: Duration::from_secs(self.scale.min_age_secs),
            max_loops: DEFAULT_MAX_LOOPS,
            retry_wait: DEFAULT_RETRY_WAIT,
        })
    }

    /// Runner VM template. Reads the startup and shutdown scripts.
    pub fn runner_template(&self) -> Result<RunnerTemplate> {
        let read = |path: &Option<PathBuf>| -> Result<Option<String>> {
            path.as_ref()
                .map(|p| {
                    std::fs::read_to_string(p)
                        .with_context(|| format!("failed to read script {}", p.display()))
                })
                .transpose()
        };

        Ok(RunnerTemplate {
            machine_type: self.runner.machine_type.clone(),
            image: self.runner.image.clone(),
            network: self.runner.network.clone(),
            preemptible: self.runner.preemptible,
            service_account: self.runner.service_account.clone(),
            github_org: self.github_org.clone(),
            runner_labels: self.runner.labels.clone(),
            taint_labels: self.runner.taint_labels.clone(),
            remove_token_url: self.runner.remove_token_url.clone(),
            startup_script: read(&self.runner.startup_script)?,
            shutdown_script: read(&self.runner.shutdown_script)?,
        })
    }

    /// Interval between periodic evaluations.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// TTL of the per-environment scale lease.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}
