mod pass;
mod slurm;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::sizes::{DatasetInfoCache, HubClient};
use common::{AutomationConfig, Catalog, CatalogConfig};

use crate::pass::{run_pass, PassReport};
use crate::slurm::Slurm;

pub const DEFAULT_LOG_FILTER: &str = "scheduler=info,common=info";

/// Submits the evaluation jobs that are still missing for every configured model.
#[derive(Debug, Parser)]
#[command(name = "scheduler", version)]
struct Args {
    #[arg(long, default_value = "configs/automation.json")]
    config_path: PathBuf,

    #[arg(long, default_value = "configs/all_tasks.json")]
    tasks_path: PathBuf,

    /// Tasks to submit again even if they already have results.
    #[arg(long, num_args = 0..)]
    force_tasks: Vec<String>,

    /// Run with the official inference container; tasks it cannot run are dropped.
    #[arg(long)]
    use_official_vllm: bool,

    /// Log the sbatch commands instead of running them.
    #[arg(long)]
    dry_run: bool,

    /// Keep running, one pass every N seconds.
    #[arg(long)]
    interval_secs: Option<u64>,
}

async fn load_catalog(tasks_path: &Path, excluded: Option<&[String]>) -> Result<Catalog> {
    let config = CatalogConfig::load(tasks_path)
        .with_context(|| format!("reading task catalog {}", tasks_path.display()))?;

    let mut sizes = DatasetInfoCache::new();
    sizes
        .warm(&HubClient::from_env(), config.names_needing_size())
        .await
        .context("fetching dataset sizes")?;

    let catalog = Catalog::build(&config, &sizes).context("building task catalog")?;
    Ok(match excluded {
        Some(patterns) => catalog.excluding(patterns),
        None => catalog,
    })
}

async fn one_pass(args: &Args) -> Result<PassReport> {
    let cfg = AutomationConfig::load(&args.config_path)
        .with_context(|| format!("reading {}", args.config_path.display()))?;

    let excluded = args
        .use_official_vllm
        .then_some(cfg.sbatch.official_excluded.as_slice());
    let catalog = load_catalog(&args.tasks_path, excluded).await?;

    let slurm = Slurm::new(&cfg.sbatch, args.use_official_vllm, args.dry_run);
    run_pass(&cfg, &catalog, &slurm, &args.force_tasks).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();

    let Some(interval) = args.interval_secs else {
        let report = one_pass(&args).await?;
        info!("{}", serde_json::to_string(&report)?);
        return Ok(());
    };

    info!("scheduling every {}s", interval);
    loop {
        match one_pass(&args).await {
            Ok(report) => info!("{}", serde_json::to_string(&report)?),
            Err(e) => error!("pass failed: {:#}", e),
        }
        sleep(Duration::from_secs(interval)).await;
    }
}
