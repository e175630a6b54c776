mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use common::TaskKind;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Inspect the evaluation task catalog and harness results")]
struct Cli {
    /// Task catalog configuration
    #[arg(long, global = true, default_value = "configs/all_tasks.json")]
    tasks_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

fn parse_kind(s: &str) -> Result<TaskKind, String> {
    match s {
        "pretrain" => Ok(TaskKind::Pretrain),
        "posttrain" => Ok(TaskKind::Posttrain),
        other => Err(format!("unknown task kind {other} (pretrain|posttrain)")),
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Comma-separated task names, optionally of one kind
    Tasks {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<TaskKind>,
    },
    /// Weight of every task, by name
    Sizes,
    /// Estimated run time per task and tasks per dimension
    Info {
        /// Minutes the largest model needs for the whole catalog
        #[arg(long, default_value_t = 540.0)]
        total_minutes: f64,
    },
    /// Canonical shard layout for one configured model
    Shards {
        #[arg(long)]
        model: String,

        #[arg(long, default_value = "configs/automation.json")]
        config_path: PathBuf,
    },
    /// Harness group file listing every task
    TaskYaml {
        #[arg(long, default_value = "default.yaml")]
        out: PathBuf,
    },
    /// Add regional aggregates to a harness results file
    Aggregate {
        #[arg(long)]
        results: PathBuf,

        /// JSON object whose keys are all benchmark languages
        #[arg(long)]
        benchmarks: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Commands::Aggregate { quiet: true, .. } => "warn",
        _ => "client=info,common=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Tasks { kind } => cli::tasks(&cli.tasks_path, kind).await,
        Commands::Sizes => cli::sizes(&cli.tasks_path).await,
        Commands::Info { total_minutes } => cli::info(&cli.tasks_path, total_minutes).await,
        Commands::Shards { model, config_path } => {
            cli::shards(&cli.tasks_path, &config_path, &model).await
        }
        Commands::TaskYaml { out } => cli::task_yaml(&cli.tasks_path, &out).await,
        Commands::Aggregate {
            results,
            benchmarks,
            output,
            ..
        } => cli::aggregate(&results, &benchmarks, &output),
    }
}
