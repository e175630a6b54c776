//! Packages missing tasks into job submissions.
//!
//! Canonical shards that are entirely missing go out under their own label so a
//! later pass can map them back; whatever is left is split into `mixed` jobs.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{EvalError, Result};
use crate::label::{JobLabel, JobName};
use crate::partition::{partition_allowing_empty, shards_needed, Partition, Shard};
use crate::state::iteration_dir_name;
use crate::task::Task;

/// Mixed jobs with more tasks than this are logged without their task list.
const MAX_LOGGED_TASKS: usize = 32;

/// One checkpoint to evaluate.
#[derive(Debug, Clone)]
pub struct SubmissionTarget {
    pub model: String,
    /// Checkpoint directory or hub repository name.
    pub checkpoint: String,
    pub iteration: u64,
    pub tokens_per_iter: String,
    pub model_size: f64,
    pub logs_root: PathBuf,
    /// Added on top of the standard job environment; wins on conflicts.
    pub extra_env: BTreeMap<String, String>,
}

/// A job ready to hand to the batch scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct JobSubmission {
    pub name: JobName,
    pub checkpoint: String,
    pub iteration: u64,
    pub tokens_per_iter: String,
    pub tasks: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Published checkpoint; only these may run in the official inference image.
    pub hub_checkpoint: bool,
}

impl JobSubmission {
    fn new(target: &SubmissionTarget, label: JobLabel, shard: &Shard<'_>) -> Self {
        let tasks: Vec<String> = shard.names().into_iter().map(str::to_string).collect();

        let mut env = BTreeMap::new();
        env.insert("LOGS_ROOT".to_string(), target.logs_root.display().to_string());
        env.insert("SIZE".to_string(), target.model_size.to_string());
        env.insert("TASKS".to_string(), tasks.join(","));
        env.insert("BACKEND".to_string(), "hf".to_string());
        env.extend(target.extra_env.clone());

        Self {
            name: JobName::new(target.model.clone(), label, target.iteration),
            checkpoint: target.checkpoint.clone(),
            iteration: target.iteration,
            tokens_per_iter: target.tokens_per_iter.clone(),
            tasks,
            env,
            hub_checkpoint: false,
        }
    }

    pub fn job_name(&self) -> String {
        self.name.to_string()
    }

    /// Positional arguments of the evaluation script:
    /// `checkpoint iteration tokens_per_iter model`.
    pub fn script_args(&self) -> Vec<String> {
        vec![
            self.checkpoint.clone(),
            self.iteration.to_string(),
            self.tokens_per_iter.clone(),
            self.name.model.clone(),
        ]
    }
}

/// Turns the missing tasks of one checkpoint into submissions.
///
/// Empty shards never produce a submission.
pub fn dispatch<'a>(
    target: &SubmissionTarget,
    missing: &[&'a Task],
    canonical: &Partition<'a>,
    max_samples: u64,
) -> Result<Vec<JobSubmission>> {
    let mut remaining: HashSet<&str> = missing.iter().map(|t| t.name.as_str()).collect();
    let mut submissions = Vec::new();

    /* ==== CANONICAL SHARDS ==== */
    for (index, shard) in canonical.iter().enumerate() {
        if shard.is_empty() {
            continue;
        }
        if shard.tasks().iter().all(|t| remaining.contains(t.name.as_str())) {
            for t in shard.tasks() {
                remaining.remove(t.name.as_str());
            }
            let label = JobLabel::Shard {
                index,
                count: canonical.len(),
            };
            submissions.push(JobSubmission::new(target, label, shard));
        }
    }

    /* ==== MIXED REMAINDER ==== */
    let leftover: Vec<&'a Task> = missing
        .iter()
        .copied()
        .filter(|t| remaining.contains(t.name.as_str()))
        .collect();

    if !leftover.is_empty() {
        let weight: u64 = leftover.iter().map(|t| t.weight).sum();
        let count = shards_needed(weight, max_samples)?;
        debug!(
            "{} iter {}: {} leftover tasks (weight {}) into {} mixed shards",
            target.model,
            target.iteration,
            leftover.len(),
            weight,
            count
        );
        for shard in partition_allowing_empty(&leftover, count)?.iter() {
            if shard.is_empty() {
                continue;
            }
            submissions.push(JobSubmission::new(target, JobLabel::Mixed, shard));
        }
    }

    for s in &submissions {
        if s.name.label == JobLabel::Mixed && s.tasks.len() <= MAX_LOGGED_TASKS {
            info!("prepared {} {:?}", s.name, s.tasks);
        } else {
            info!("prepared {} ({} tasks)", s.name, s.tasks.len());
        }
    }

    Ok(submissions)
}

/// The single `{dir}/iter_{iteration:07}` among `model_dirs`.
pub fn resolve_checkpoint(model: &str, model_dirs: &[PathBuf], iteration: u64) -> Result<PathBuf> {
    let dir_name = iteration_dir_name(iteration);
    let candidates: Vec<PathBuf> = model_dirs
        .iter()
        .filter(|dir| dir.join(&dir_name).exists())
        .cloned()
        .collect();

    match candidates.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(EvalError::PathResolution {
            model: model.to_string(),
            iteration,
            candidates,
        }),
    }
}
