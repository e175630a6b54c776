//! Converted checkpoints left behind by evaluation jobs.
//!
//! Jobs write into `{temp}/{job name}`; once the job has left the queue the
//! directory is moved to `{storage}/{model}_it{iteration}` and only the newest
//! few per model are kept.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::label::JobName;
use crate::state::RunningJobs;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub moved: usize,
    pub removed: usize,
    pub skipped_running: usize,
}

pub fn stored_name(model: &str, iteration: u64) -> String {
    format!("{model}_it{iteration}")
}

/// `llama_8b_it1000` -> `("llama_8b", 1000)`.
pub fn parse_stored_name(name: &str) -> Option<(&str, u64)> {
    let (model, it) = name.rsplit_once("_it")?;
    if model.is_empty() || it.is_empty() || !it.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((model, it.parse().ok()?))
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies `source` into the new path `dest`, recursing into directories.
fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    if !source.is_dir() {
        fs::copy(source, dest)?;
        return Ok(());
    }
    fs::create_dir(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}

/// `rename`, or copy then delete when the two paths are on different
/// filesystems. A half-written copy is removed again.
fn move_path(source: &Path, dest: &Path) -> std::io::Result<()> {
    let err = match fs::rename(source, dest) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!("rename of {} failed ({}), copying instead", source.display(), err);

    if let Err(e) = copy_tree(source, dest) {
        let _ = remove_path(dest);
        return Err(e);
    }
    remove_path(source)
}

/// Moves finished job outputs from `temp_dir` into `storage_dir`.
///
/// Outputs of queued jobs are left in place. When the destination already
/// exists (another job of the same checkpoint finished first) the source is
/// deleted instead. Failures on one entry are logged and do not stop the rest.
pub fn migrate(temp_dir: &Path, storage_dir: &Path, running: &RunningJobs) -> Result<MigrationSummary> {
    let mut summary = MigrationSummary::default();
    fs::create_dir_all(storage_dir)?;

    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        if running.contains_name(name) {
            summary.skipped_running += 1;
            continue;
        }
        let job = match name.parse::<JobName>() {
            Ok(job) => job,
            Err(_) => {
                debug!("leaving {} in place (not an evaluation job)", name);
                continue;
            }
        };

        let source = entry.path();
        let dest = storage_dir.join(stored_name(&job.model, job.iteration));
        if dest.exists() {
            info!("removing {} ({} already stored)", source.display(), dest.display());
            match remove_path(&source) {
                Ok(()) => summary.removed += 1,
                Err(e) => warn!("cannot remove {}: {}", source.display(), e),
            }
        } else {
            info!("moving {} to {}", source.display(), dest.display());
            match move_path(&source, &dest) {
                Ok(()) => summary.moved += 1,
                Err(e) => warn!("cannot move {}: {}", source.display(), e),
            }
        }
    }

    Ok(summary)
}

/// Deletes stored checkpoints of `models` beyond the `keep` newest iterations.
///
/// `keep == 0` disables retention. Entries of unknown models are untouched.
pub fn retain<S: AsRef<str>>(storage_dir: &Path, models: &[S], keep: usize) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if keep == 0 {
        return Ok(removed);
    }

    let mut stored: BTreeMap<String, Vec<(u64, PathBuf)>> = BTreeMap::new();
    for entry in fs::read_dir(storage_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some((model, it)) = file_name.to_str().and_then(parse_stored_name) else {
            continue;
        };
        if models.iter().any(|m| m.as_ref() == model) {
            stored.entry(model.to_string()).or_default().push((it, entry.path()));
        }
    }

    for (model, mut saved) in stored {
        saved.sort_by_key(|(it, _)| *it);
        let excess = saved.len().saturating_sub(keep);
        for (it, path) in saved.into_iter().take(excess) {
            info!("removing {} (checkpoint {} of {})", path.display(), it, model);
            match remove_path(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!("cannot remove {}: {}", path.display(), e),
            }
        }
    }

    Ok(removed)
}
