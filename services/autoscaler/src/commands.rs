//! Autoscaler commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use runpool_autoscaler::auth::{MetadataTokenSource, TokenSource};
use runpool_autoscaler::compute::ComputeClient;
use runpool_autoscaler::config::Config;
use runpool_autoscaler::executor::{BatchOutcome, DeleteOutcome, FleetExecutor};
use runpool_autoscaler::inventory::RunnerInventory;
use runpool_autoscaler::lease::LocalLease;
use runpool_autoscaler::policy::{Decision, ScalePolicy, ScaleUpState, ScaleUpTask};
use runpool_autoscaler::registry::{JobContext, RegistryClient, RunnerRegistry};
use runpool_autoscaler::retry::RetryScheduler;
use runpool_autoscaler::worker::{ScaleWorker, WorkerConfig};
use runpool_reconcile::DownRate;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Autoscaler for an elastic pool of CI runners.
#[derive(Debug, Parser)]
#[command(name = "autoscaler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create runners until `SCALE_UP_RATE` runners are not busy.
    ScaleUp,

    /// Scale up for a queued job, re-checking the job while runners are
    /// available.
    SmartScaleUp(SmartScaleUpArgs),

    /// Remove not-busy runners, keeping idle runners during the idle window.
    ScaleDown(ScaleDownArgs),

    /// Remove offline runners, then trim not-busy ones.
    SmartScaleDown(SmartScaleDownArgs),

    /// Create runners up to `SCALE_UP_MAX`.
    ScaleUpAll,

    /// Remove every not-busy runner.
    ScaleDownAll,

    /// Create a ghost runner if none is registered.
    EnsureGhost,

    /// Unregister one runner by name. Busy runners are left alone.
    DeleteRunner(DeleteRunnerArgs),

    /// Print a token runners use to unregister themselves.
    RemoveToken,

    /// List runner VMs that never registered.
    Sweep(SweepArgs),

    /// Run the periodic scale loop until interrupted.
    Run,
}

#[derive(Debug, Args)]
struct SmartScaleUpArgs {
    /// Repository owner of the queued job.
    #[arg(long, requires_all = ["repo", "check_run_id"])]
    owner: Option<String>,

    /// Repository of the queued job.
    #[arg(long, requires_all = ["owner", "check_run_id"])]
    repo: Option<String>,

    /// Check run id of the queued job.
    #[arg(long, requires_all = ["owner", "repo"])]
    check_run_id: Option<u64>,

    /// Resume a task given as JSON instead.
    #[arg(long, conflicts_with_all = ["owner", "repo", "check_run_id"])]
    task: Option<String>,

    /// Run a single step and print the pending task as JSON.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Args)]
struct ScaleDownArgs {
    /// Remove exactly this many not-busy runners instead.
    #[arg(long)]
    count: Option<u32>,
}

#[derive(Debug, Args)]
struct SmartScaleDownArgs {
    /// Maximum runners removed; negative removes all. Defaults to
    /// `SCALE_DOWN_RATE`.
    #[arg(long, allow_hyphen_values = true)]
    down_rate: Option<i64>,

    /// Not-busy runners to keep. Defaults to `SCALE_IDLE_COUNT`.
    #[arg(long)]
    idle_count: Option<u32>,

    /// Minimum runner age in seconds. Defaults to `SCALE_MIN_AGE_SECONDS`.
    #[arg(long)]
    min_age_secs: Option<u64>,
}

#[derive(Debug, Args)]
struct DeleteRunnerArgs {
    /// Runner name.
    name: String,
}

#[derive(Debug, Args)]
struct SweepArgs {
    /// Minimum VM age in seconds.
    #[arg(long, default_value_t = 86_400)]
    max_age_secs: u64,
}

struct Services {
    policy: Arc<ScalePolicy>,
    registry: Arc<dyn RunnerRegistry>,
}

fn build(config: &Config) -> Result<Services> {
    let tokens: Arc<dyn TokenSource> = Arc::new(MetadataTokenSource::new(&config.metadata_url)?);
    let fleet = Arc::new(ComputeClient::new(
        &config.compute_url,
        &config.project,
        &config.zone,
        Arc::clone(&tokens),
    )?);
    let registry: Arc<dyn RunnerRegistry> = Arc::new(RegistryClient::new(
        &config.registry_url,
        &config.github_org,
        tokens,
    )?);

    let inventory = RunnerInventory::new(fleet.clone(), Arc::clone(&registry), config.naming()?);
    let executor = FleetExecutor::new(
        fleet,
        Arc::clone(&registry),
        inventory.clone(),
        config.runner_template()?,
    );
    let policy = ScalePolicy::new(
        inventory,
        executor,
        Arc::clone(&registry),
        Arc::new(LocalLease::new()),
        config.policy()?,
    )
    .with_lease_ttl(config.lease_ttl());

    Ok(Services {
        policy: Arc::new(policy),
        registry,
    })
}

fn log_batch(action: &str, decision: Decision<BatchOutcome>) -> Result<()> {
    match decision {
        Decision::Applied(outcome) => {
            info!(
                action,
                succeeded = outcome.succeeded_count(),
                failed = outcome.failed_count(),
                retained = outcome.retained_count(),
                "Done"
            );
            for (name, error) in &outcome.failed {
                warn!(action, name = %name, error = %error, "Runner failed");
            }
        }
        Decision::Contended => info!(action, "Skipped, another scale decision is in flight"),
    }
    Ok(())
}

impl Cli {
    /// Run the command.
    pub async fn run(self) -> Result<()> {
        let config = Config::from_env()?;
        info!(
            env = %config.env,
            project = %config.project,
            zone = %config.zone,
            "Configuration loaded"
        );
        let services = build(&config)?;
        let policy = &services.policy;

        match self.command {
            Commands::ScaleUp => log_batch("scale-up", policy.scale_up().await?),
            Commands::SmartScaleUp(args) => smart_scale_up(&services, args).await,
            Commands::ScaleDown(args) => match args.count {
                Some(count) => log_batch("scale-down", policy.scale_down(count).await?),
                None => log_batch("scale-down", policy.periodic_scale_down(Utc::now()).await?),
            },
            Commands::SmartScaleDown(args) => {
                let down_rate = args
                    .down_rate
                    .map(DownRate::from)
                    .unwrap_or(policy.config().down_rate);
                let idle_count = args.idle_count.unwrap_or(policy.config().idle_count);
                let min_age = args
                    .min_age_secs
                    .map(Duration::from_secs)
                    .unwrap_or(policy.config().min_age);

                match policy.smart_scale_down(down_rate, idle_count, min_age).await? {
                    Decision::Applied(outcome) => {
                        log_batch("smart-scale-down offline", Decision::Applied(outcome.offline))?;
                        log_batch("smart-scale-down trim", Decision::Applied(outcome.trimmed))
                    }
                    Decision::Contended => log_batch("smart-scale-down", Decision::Contended),
                }
            }
            Commands::ScaleUpAll => log_batch("scale-up-all", policy.scale_up_all().await?),
            Commands::ScaleDownAll => log_batch("scale-down-all", policy.scale_down_all().await?),
            Commands::EnsureGhost => {
                match policy.ensure_ghost().await? {
                    Decision::Applied(Some(name)) => info!(name = %name, "Ghost runner created"),
                    Decision::Applied(None) => info!("Ghost runner already registered"),
                    Decision::Contended => info!("Skipped, another scale decision is in flight"),
                }
                Ok(())
            }
            Commands::DeleteRunner(args) => {
                let name = &args.name;
                match policy.executor().delete_runner(name).await? {
                    DeleteOutcome::Deleted { id } => info!(name = %name, runner_id = id, "Runner deleted"),
                    DeleteOutcome::AlreadyGone => info!(name = %name, "Runner not registered"),
                    DeleteOutcome::Busy { id } => {
                        warn!(name = %name, runner_id = id, "Runner is busy, left registered")
                    }
                }
                Ok(())
            }
            Commands::RemoveToken => {
                let token = services.registry.create_remove_token().await?;
                println!("{token}");
                Ok(())
            }
            Commands::Sweep(args) => {
                let stale = policy
                    .inventory()
                    .list_stale_unregistered(Duration::from_secs(args.max_age_secs))
                    .await?;
                for runner in &stale {
                    warn!(name = %runner.name, status = %runner.status, "Runner VM never registered");
                    println!("{}", runner.name);
                }
                info!(count = stale.len(), "Sweep finished");
                Ok(())
            }
            Commands::Run => run_worker(&services, &config).await,
        }
    }
}

async fn smart_scale_up(services: &Services, args: SmartScaleUpArgs) -> Result<()> {
    let task = match args.task {
        Some(json) => serde_json::from_str(&json).context("invalid --task JSON")?,
        None => {
            let job = match (args.owner, args.repo, args.check_run_id) {
                (Some(owner), Some(repo), Some(check_run_id)) => Some(JobContext {
                    owner,
                    repo,
                    check_run_id,
                }),
                _ => None,
            };
            ScaleUpTask::new(job)
        }
    };

    let state = if args.once {
        services.policy.step(task).await?
    } else {
        RetryScheduler::new(Arc::clone(&services.policy))
            .run_to_completion(task)
            .await?
    };

    match state {
        ScaleUpState::Waiting(task) => {
            info!(rechecks = task.rechecks, "Scale up pending");
            println!("{}", serde_json::to_string(&task)?);
        }
        ScaleUpState::Scaled(outcome) => log_batch("smart-scale-up", Decision::Applied(outcome))?,
        other => info!(state = ?other, "Smart scale up finished"),
    }
    Ok(())
}

async fn run_worker(services: &Services, config: &Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ScaleWorker::new(
        Arc::clone(&services.policy),
        WorkerConfig {
            interval: config.tick_interval(),
            smart_scale_down: config.scale.smart_scale_down,
        },
    );
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.await {
        error!(error = %e, "Scale worker panicked");
    }

    info!("Autoscaler shutdown complete");
    Ok(())
}
