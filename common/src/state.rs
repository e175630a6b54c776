//! Snapshot of what the cluster already did or is doing.
//!
//! * running jobs, parsed from the batch scheduler listing
//! * completed tasks, read from the durable results tree
//!
//! Both are read once per pass; nothing here is updated incrementally.

use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::label::{JobLabel, JobName};
use crate::results::ResultsFile;

/// Completed task names per iteration, for one model.
pub type CompletedTasks = BTreeMap<u64, HashSet<String>>;

/// Evaluation jobs currently in the queue.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs {
    by_model: BTreeMap<String, BTreeMap<u64, Vec<JobLabel>>>,
    names: BTreeSet<String>,
}

impl RunningJobs {
    /// Parses one job name per line (`squeue --format="%j" --noheader`).
    /// Quotes around names are stripped; names outside the eval grammar are skipped.
    pub fn from_listing(listing: &str) -> Self {
        Self::from_names(listing.lines())
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut running = RunningJobs::default();

        for raw in names {
            let name = raw.as_ref().trim().trim_matches('"');
            if name.is_empty() {
                continue;
            }
            match name.parse::<JobName>() {
                Ok(job) => {
                    running.names.insert(name.to_string());
                    running.push_label(job);
                }
                Err(_) => debug!("ignoring job {} (not an evaluation job)", name),
            }
        }

        running
    }

    pub fn insert(&mut self, job: JobName) {
        self.names.insert(job.to_string());
        self.push_label(job);
    }

    fn push_label(&mut self, job: JobName) {
        self.by_model
            .entry(job.model)
            .or_default()
            .entry(job.iteration)
            .or_default()
            .push(job.label);
    }

    /// Labels running for `(model, iteration)`, in listing order.
    pub fn labels(&self, model: &str, iteration: u64) -> &[JobLabel] {
        self.by_model
            .get(model)
            .and_then(|its| its.get(&iteration))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn for_model(&self, model: &str) -> Option<&BTreeMap<u64, Vec<JobLabel>>> {
        self.by_model.get(model)
    }

    /// Whether a job with exactly this name is queued.
    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.by_model
            .values()
            .flat_map(|its| its.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `iter_0001000` -> 1000.
pub fn parse_iteration_dir(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("iter_")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn iteration_dir_name(iteration: u64) -> String {
    format!("iter_{iteration:07}")
}

/// Glob for every results file of `model` under `logs_root`.
pub fn results_glob(logs_root: &Path, model: &str) -> String {
    format!(
        "{}/{}/iter_*/harness/eval_*/*/results*.json",
        Pattern::escape(&logs_root.to_string_lossy()),
        Pattern::escape(model)
    )
}

/// Scans `{logs_root}/{model}/iter_*/harness/eval_*/*/results*.json`.
///
/// Every key of a file's `results` counts as completed. A file or directory
/// that cannot be read is an error for the whole model.
pub fn scan_completed(logs_root: &Path, model: &str) -> Result<CompletedTasks> {
    let mut completed = CompletedTasks::new();

    for entry in glob::glob(&results_glob(logs_root, model))? {
        let path = entry?;

        // results*.json <- run dir <- eval_* <- harness <- iter_*
        let Some(iteration) = path
            .ancestors()
            .nth(4)
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(parse_iteration_dir)
        else {
            debug!("skipping {} (no iteration directory)", path.display());
            continue;
        };

        let file = ResultsFile::load(&path)?;
        completed
            .entry(iteration)
            .or_default()
            .extend(file.task_names().map(str::to_string));
    }

    Ok(completed)
}

/// Checkpoint iterations present as `iter_*` directories under any of `model_dirs`.
pub fn available_iterations(model_dirs: &[PathBuf]) -> BTreeSet<u64> {
    let mut available = BTreeSet::new();

    for dir in model_dirs {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("cannot list checkpoints in {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(it) = entry.file_name().to_str().and_then(parse_iteration_dir) {
                available.insert(it);
            }
        }
    }

    available
}
