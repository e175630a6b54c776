use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::info;

use common::aggregate::{add_regional_aggregates, load_language_names};
use common::results::ResultsFile;
use common::sizes::{DatasetInfoCache, HubClient};
use common::{canonical_shard_count, AutomationConfig, CanonicalCache, Catalog, CatalogConfig, Dimension, TaskKind};

/// Catalog with sizes fetched from the datasets-server.
pub async fn load_catalog(tasks_path: &Path) -> Result<Catalog> {
    let config = CatalogConfig::load(tasks_path)
        .with_context(|| format!("reading task catalog {}", tasks_path.display()))?;
    let mut sizes = DatasetInfoCache::new();
    sizes
        .warm(&HubClient::from_env(), config.names_needing_size())
        .await
        .context("fetching dataset sizes")?;
    Ok(Catalog::build(&config, &sizes)?)
}

/// `90.5` minutes -> `1h30m30s`.
pub fn time_str(minutes: f64) -> String {
    let hours = (minutes / 60.0) as u64;
    let mins = minutes as u64 % 60;
    let secs = (minutes * 60.0) as u64 % 60;
    format!("{hours}h{mins}m{secs}s")
}

pub async fn tasks(tasks_path: &Path, kind: Option<TaskKind>) -> Result<()> {
    let catalog = load_catalog(tasks_path).await?;
    let names: Vec<&str> = catalog
        .iter()
        .filter(|t| kind.map_or(true, |k| t.has_kind(k)))
        .map(|t| t.name.as_str())
        .collect();
    println!("{}", names.join(","));
    Ok(())
}

pub async fn sizes(tasks_path: &Path) -> Result<()> {
    let catalog = load_catalog(tasks_path).await?;
    let mut tasks: Vec<_> = catalog.iter().collect();
    tasks.sort_by(|a, b| a.name.cmp(&b.name));

    println!("Estimated sizes:");
    for t in tasks {
        println!("{}: {}", t.name, t.weight);
    }
    println!("Total size: {}", catalog.total_weight());
    Ok(())
}

pub async fn info(tasks_path: &Path, total_minutes: f64) -> Result<()> {
    let catalog = load_catalog(tasks_path).await?;
    let total = catalog.total_weight() as f64;

    let mut tasks: Vec<_> = catalog.iter().collect();
    tasks.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

    println!("Estimated sizes:");
    for t in tasks {
        let minutes = total_minutes * t.weight as f64 / total;
        println!("{}: {}rows ({})", t.name, t.weight, time_str(minutes));
    }
    println!("Total size: {} Total time: {}", catalog.total_weight(), time_str(total_minutes));
    println!();

    for dim in Dimension::ALL {
        let names: Vec<&str> = catalog
            .iter()
            .filter(|t| t.dimension == dim)
            .map(|t| t.name.as_str())
            .collect();
        if !names.is_empty() {
            println!("Dimension: {} tasks: {:?}", dim, names);
        }
    }
    Ok(())
}

pub async fn shards(tasks_path: &Path, config_path: &Path, model: &str) -> Result<()> {
    let cfg = AutomationConfig::load(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let model_cfg = cfg
        .models
        .get(model)
        .ok_or_else(|| anyhow!("model {model} is not configured"))?;

    let catalog = load_catalog(tasks_path).await?;
    let budget = cfg.max_samples.max_samples(model_cfg.size)?;
    let count = canonical_shard_count(&catalog, budget)?;

    let mut cache = CanonicalCache::new(&catalog);
    let partition = cache.canonical(count)?;

    println!(
        "{model}: size {} -> max_samples {budget}, {count} shards (imbalance {})",
        model_cfg.size,
        partition.imbalance()
    );
    for (i, shard) in partition.iter().enumerate() {
        println!("shard{i}of{count}: weight {} tasks {}", shard.weight(), shard.names().join(","));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct AggregateMetric {
    metric: &'static str,
    aggregation: &'static str,
    weight_by_size: bool,
}

#[derive(Debug, Serialize)]
struct Metadata {
    version: f64,
}

/// Harness task group covering the whole catalog.
#[derive(Debug, Serialize)]
struct TaskGroup {
    group: &'static str,
    tasks: Vec<String>,
    aggregate_metric_list: Vec<AggregateMetric>,
    metadata: Metadata,
}

fn task_group(catalog: &Catalog) -> TaskGroup {
    let mut tasks: Vec<String> = catalog.iter().map(|t| t.name.clone()).collect();
    tasks.sort();

    TaskGroup {
        group: "swissai_eval",
        tasks,
        aggregate_metric_list: ["acc", "acc_norm", "perplexity", "f1", "exact_match"]
            .into_iter()
            .map(|metric| AggregateMetric {
                metric,
                aggregation: "mean",
                weight_by_size: false,
            })
            .collect(),
        metadata: Metadata { version: 1.1 },
    }
}

pub async fn task_yaml(tasks_path: &Path, out: &Path) -> Result<()> {
    let catalog = load_catalog(tasks_path).await?;
    let yaml = serde_yaml::to_string(&task_group(&catalog))?;
    fs::write(out, yaml).with_context(|| format!("writing {}", out.display()))?;
    info!("wrote {} tasks to {}", catalog.len(), out.display());
    Ok(())
}

pub fn aggregate(results: &Path, benchmarks: &Path, output: &Path) -> Result<()> {
    info!("reading input files");
    let mut file = ResultsFile::load(results)
        .with_context(|| format!("reading {}", results.display()))?;
    let languages = load_language_names(benchmarks)
        .with_context(|| format!("reading {}", benchmarks.display()))?;

    add_regional_aggregates(&mut file, &languages);

    file.save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!("wrote augmented results to {}", output.display());
    Ok(())
}
