//! crmtrail CLI
//!
//! Runs the configured jobs on their schedule, or one job once for an
//! external scheduler, and manages job watermarks.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use crmtrail::jobs::build_job;
use crmtrail::scheduler::start_jobs;
use crmtrail::{build_coordinator, build_store, init_logging, AppConfig};
use crmtrail_state::{format_watermark, parse_watermark, Checkpoint};
use log::info;

#[derive(Parser)]
#[clap(name = "crmtrail")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Incremental extraction of CRM log tables into telemetry events", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled job on its schedule until interrupted
    Run {
        /// Configuration file
        #[clap(short, long)]
        config: PathBuf,
    },

    /// Run one job once; exits non-zero when the run fails
    Once {
        /// Configuration file
        #[clap(short, long)]
        config: PathBuf,

        /// Job name
        #[clap(short, long)]
        job: String,
    },

    /// Write a job's watermark, e.g. to give a window job its baseline
    SeedWatermark {
        /// Configuration file
        #[clap(short, long)]
        config: PathBuf,

        /// Job name
        #[clap(short, long)]
        job: String,

        /// Watermark, e.g. 2024-01-01T00:00:00Z
        #[clap(long)]
        at: String,
    },

    /// Print a job's watermark
    ShowWatermark {
        /// Configuration file
        #[clap(short, long)]
        config: PathBuf,

        /// Job name
        #[clap(short, long)]
        job: String,
    },

    /// Check a configuration file
    Validate {
        /// Configuration file
        #[clap(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::from_yaml_file(path)?;
    config.validate().with_context(|| format!("Invalid configuration {}", path.display()))?;
    Ok(config)
}

fn job_checkpoint(config: &AppConfig, job: &str) -> anyhow::Result<Checkpoint> {
    let job = config.job(job).ok_or_else(|| anyhow!("No job named '{}'", job))?;
    let store = build_store(&config.storage)?;
    Ok(Checkpoint::new(job.checkpoint_key(), store))
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load_config(&config)?;
            let store = build_store(&config.storage)?;
            let coordinator = build_coordinator(&config, store)?;

            let jobs = config
                .jobs
                .iter()
                .filter(|job| job.enabled)
                .map(|job| Ok((build_job(job)?, job.schedule())))
                .collect::<crmtrail_core::error::Result<Vec<_>>>()?;
            if jobs.is_empty() {
                bail!("No enabled jobs in the configuration");
            }

            let actors = start_jobs(&coordinator, jobs);
            info!("crmtrail {} started {} job(s) for {}", crmtrail::VERSION, actors.len(), config.project_name);

            tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
            actix::System::current().stop();
        }

        Commands::Once { config, job } => {
            let config = load_config(&config)?;
            let job_config = config.job(&job).ok_or_else(|| anyhow!("No job named '{}'", job))?;
            let store = build_store(&config.storage)?;
            let coordinator = build_coordinator(&config, store)?;

            let policy = build_job(job_config)?;
            let report = coordinator.run_now(policy.as_ref()).await;
            println!("{}", report);
            if report.is_failed() {
                bail!("Run of '{}' failed", job);
            }
        }

        Commands::SeedWatermark { config, job, at } => {
            let config = load_config(&config)?;
            let watermark = parse_watermark(&at)?;
            let checkpoint = job_checkpoint(&config, &job)?;

            checkpoint.reset(watermark).await?;
            println!("{} = {}", checkpoint.stream(), format_watermark(&watermark));
        }

        Commands::ShowWatermark { config, job } => {
            let config = load_config(&config)?;
            let checkpoint = job_checkpoint(&config, &job)?;

            match checkpoint.read().await? {
                Some(watermark) => println!("{} = {}", checkpoint.stream(), format_watermark(&watermark)),
                None => println!("{} has no watermark", checkpoint.stream()),
            }
        }

        Commands::Validate { config } => {
            let path = config;
            let config = load_config(&path)?;
            println!("{} is valid", path.display());
            println!("Project: {}", config.project_name);
            for job in &config.jobs {
                let policy = build_job(job)?;
                println!(
                    "  {} ({:?}) every {}s{}",
                    job.name,
                    policy.window_policy(),
                    job.schedule_secs,
                    if job.enabled { "" } else { ", disabled" }
                );
            }
        }
    }

    Ok(())
}
