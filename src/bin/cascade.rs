//! cascade CLI: seed a job queue and let the running jobs drain it.

use cascade_rs::balance::Balancer;
use cascade_rs::config::Config;
use cascade_rs::descriptor::{self, JobManifest, Layout};
use cascade_rs::engine::{AdmissionConfig, AdmissionController, ExecutorConfig, INITIAL_BATCH, JobEntry};
use cascade_rs::lock;
use cascade_rs::model::TurnOutcome;
use cascade_rs::queue::QueueStore;
use cascade_rs::slurm::{BatchService, Slurm};
use cascade_rs::telemetry::{TelemetryConfig, init_telemetry, job_attributes};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cascade", about = "Drain a job queue into Slurm without a coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write one job script per manifest entry and queue them all
    Seed {
        /// TOML manifest of jobs
        #[arg(long)]
        manifest: PathBuf,
        /// Results root; shfiles/, queue_dir/ and results/ live under it
        #[arg(long)]
        results_dir: PathBuf,
        /// cascade binary the job scripts call (defaults to this one)
        #[arg(long)]
        cascade_bin: Option<PathBuf>,
        /// Queue jobs again even if an earlier run already submitted them
        #[arg(long)]
        requeue: bool,
    },
    /// Seed, then submit the first small batch; running jobs do the rest
    Start {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        results_dir: PathBuf,
        #[arg(long)]
        cascade_bin: Option<PathBuf>,
        #[arg(long)]
        requeue: bool,
        /// Size of the first batch
        #[arg(long, default_value_t = INITIAL_BATCH)]
        initial_batch: usize,
        /// Print the turn outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one scheduling turn by hand, e.g. to restart a stalled queue
    Turn {
        #[arg(long)]
        queue_dir: PathBuf,
        /// Cap on submissions this turn
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Job entry point: one scheduling turn, the balancer, then the payload
    Enter {
        #[arg(long)]
        queue_dir: PathBuf,
        #[arg(long)]
        results_dir: PathBuf,
        /// Payload command, after `--`
        #[arg(last = true)]
        payload: Vec<String>,
    },
    /// Show queue length, lock holder and batch capacity
    Status {
        #[arg(long)]
        queue_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "cascade".to_string(),
        default_filter: config.log_level.clone(),
        attributes: job_attributes(
            &config.cluster.to_string(),
            &config.user,
            config.job_id.as_deref(),
        ),
    })?;

    match cli.command {
        Command::Seed {
            manifest,
            results_dir,
            cascade_bin,
            requeue,
        } => {
            cmd_seed(&manifest, &results_dir, cascade_bin, requeue)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Start {
            manifest,
            results_dir,
            cascade_bin,
            requeue,
            initial_batch,
            json,
        } => {
            let layout = cmd_seed(&manifest, &results_dir, cascade_bin, requeue)?;
            cmd_start(&config, &layout, initial_batch, json).await
        }
        Command::Turn {
            queue_dir,
            limit,
            json,
        } => cmd_turn(&config, &queue_dir, limit, json).await,
        Command::Enter {
            queue_dir,
            results_dir,
            payload,
        } => cmd_enter(&config, &queue_dir, &results_dir, &payload).await,
        Command::Status { queue_dir } => cmd_status(&config, &queue_dir).await,
    }
}

fn slurm(config: &Config) -> Slurm {
    Slurm::new(&config.user)
        .submit_command(&config.submit_command)
        .queue_command(&config.queue_command)
}

fn controller(
    config: &Config,
    queue_dir: &Path,
    limit: Option<usize>,
) -> anyhow::Result<AdmissionController<Slurm>> {
    let store = QueueStore::open(queue_dir)?;
    let mut admission = AdmissionConfig::new(config.ceiling());
    admission.batch_limit = limit;
    admission.lock = config.lock_options();
    admission.executor = ExecutorConfig {
        submit_delay: config.submit_delay,
        ..ExecutorConfig::default()
    };
    Ok(AdmissionController::new(slurm(config), store, admission))
}

fn cmd_seed(
    manifest: &Path,
    results_dir: &Path,
    cascade_bin: Option<PathBuf>,
    requeue: bool,
) -> anyhow::Result<Layout> {
    let manifest = JobManifest::load(manifest)?;
    let cascade_bin = match cascade_bin {
        Some(path) => std::fs::canonicalize(path)?,
        None => std::env::current_exe()?,
    };
    let layout = Layout::new(results_dir);
    let report = descriptor::seed(&manifest, &layout, &cascade_bin, requeue)?;
    println!(
        "Seeded {} job(s): {} queued, {} already queued, {} already submitted",
        report.written, report.enqueued, report.already_queued, report.already_submitted
    );
    Ok(layout)
}

async fn cmd_start(
    config: &Config,
    layout: &Layout,
    initial_batch: usize,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let controller = controller(config, &layout.queue_dir(), Some(initial_batch))?;
    let outcome = controller.run_turn(&config.owner_id()).await?;
    print_outcome(&outcome, json)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_turn(
    config: &Config,
    queue_dir: &Path,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let controller = controller(config, queue_dir, limit)?;
    let outcome = controller.run_turn(&config.owner_id()).await?;
    print_outcome(&outcome, json)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_enter(
    config: &Config,
    queue_dir: &Path,
    results_dir: &Path,
    payload: &[String],
) -> anyhow::Result<ExitCode> {
    let controller = controller(config, queue_dir, None)?;
    let balancer = Balancer::from_program(config.balance_command.clone());
    let entry = JobEntry::new(
        &controller,
        &balancer,
        config.owner_id(),
        &config.user,
        results_dir,
    );

    if payload.is_empty() {
        let phase = entry.schedule().await;
        return Ok(if phase.is_fatal() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    let (_phase, code) = entry.run(payload).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn cmd_status(config: &Config, queue_dir: &Path) -> anyhow::Result<ExitCode> {
    let store = QueueStore::open(queue_dir)?;
    let pending = store.len()?;
    let holder = lock::holder(queue_dir)?;
    let active = slurm(config).active_count().await?;

    println!("Queue:      {}", queue_dir.display());
    println!("Pending:    {pending}");
    println!("Lock:       {}", holder.as_deref().unwrap_or("-"));
    println!("Cluster:    {}", config.cluster);
    println!("Active:     {active} / {}", config.ceiling());
    if pending > 0 && active == 0 {
        println!("---");
        println!("No jobs are running to continue the cascade; run `cascade turn` to restart it.");
    }
    Ok(ExitCode::SUCCESS)
}

fn print_outcome(outcome: &TurnOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    match outcome {
        TurnOutcome::QueueFull { capacity } => {
            println!(
                "Queue full: {} active, ceiling {}",
                capacity.active, capacity.ceiling
            );
        }
        TurnOutcome::Denied { holder } => {
            println!(
                "Scheduler lock held by {}; nothing submitted",
                holder.as_deref().unwrap_or("an unknown owner")
            );
        }
        TurnOutcome::Drained {
            report, remaining, ..
        } => {
            let remaining = remaining.map_or_else(|| "?".to_string(), |n| n.to_string());
            for submission in &report.submitted {
                println!("{:<12}  {}", submission.job_id, submission.name);
            }
            for failure in &report.failed {
                println!("{:<12}  {} ({})", "FAILED", failure.name, failure.error);
            }
            println!(
                "\n{} submitted, {} failed, {} still queued",
                report.submitted.len(),
                report.failed.len(),
                remaining
            );
        }
    }
    Ok(())
}
