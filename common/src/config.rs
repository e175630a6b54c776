use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::canonical::SizeClassTable;
use crate::error::{EvalError, Result};

/// `configs/automation.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    /// Root of the results tree; also exported to jobs as `LOGS_ROOT`.
    pub logs_root: PathBuf,
    /// Minimum model size -> maximum task weight per job.
    pub max_samples: SizeClassTable,
    pub models: BTreeMap<String, ModelConfig>,
    /// Where evaluation jobs drop converted checkpoints.
    #[serde(default)]
    pub hf_temp_dir: Option<PathBuf>,
    /// Where converted checkpoints are kept once their job is gone.
    #[serde(default)]
    pub hf_storage_dir: Option<PathBuf>,
    #[serde(default = "default_keep")]
    pub num_hf_checkpoints_to_keep: usize,
    #[serde(default)]
    pub sbatch: SbatchConfig,
}

fn default_keep() -> usize {
    1
}

/// How evaluation jobs are launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SbatchConfig {
    pub script: PathBuf,
    /// Container environment (`--environment`) for regular runs.
    pub environment: String,
    /// Container environment when the official inference image is requested.
    pub official_environment: String,
    /// Tasks whose name contains any of these are not run with the official image.
    pub official_excluded: Vec<String>,
    pub harness_fork: String,
    pub harness_branch: String,
}

impl Default for SbatchConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("scripts/evaluate.sbatch"),
            environment: "./containers/env.toml".to_string(),
            official_environment: "./containers/env-official.toml".to_string(),
            official_excluded: ["blend", "switzerland_qa", "include_base_new_45", "cultural_bench"]
                .into_iter()
                .map(String::from)
                .collect(),
            harness_fork: "https://github.com/EleutherAI/lm-evaluation-harness.git".to_string(),
            harness_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Parameter count in billions; selects the size class.
    #[serde(default = "default_size")]
    pub size: f64,
    #[serde(deserialize_with = "string_or_number")]
    pub tokens_per_iter: String,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub source: ModelSource,
}

fn default_size() -> f64 {
    1.0
}

/// Accepts `"4194304"` as well as `4194304`.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelSource {
    /// Training checkpoints picked up as they appear on disk.
    Megatron(MegatronSource),
    /// A fixed list of published checkpoints.
    Hub(HubSource),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MegatronSource {
    pub model_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub start_eval_from: u64,
    pub frequency: u64,
    #[serde(default)]
    pub force_iters: Vec<u64>,
}

impl MegatronSource {
    pub fn selects(&self, iteration: u64) -> bool {
        let on_schedule = iteration >= self.start_eval_from
            && (iteration - self.start_eval_from) % self.frequency == 0;
        on_schedule || self.force_iters.contains(&iteration)
    }

    /// Iterations of `available` that should be evaluated, ascending.
    pub fn eval_iterations(&self, available: &BTreeSet<u64>) -> Vec<u64> {
        available.iter().copied().filter(|&it| self.selects(it)).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubSource {
    /// Hub repository, passed to the job as the checkpoint.
    pub name: String,
    pub iters: Vec<u64>,
    /// Per-iteration revision, aligned with `iters`.
    #[serde(default)]
    pub revisions: Vec<Option<String>>,
}

impl HubSource {
    /// `(iteration, revision)` pairs; a repeated iteration keeps its first entry.
    pub fn checkpoints(&self) -> Vec<(u64, Option<&str>)> {
        let mut seen = BTreeSet::new();
        self.iters
            .iter()
            .enumerate()
            .filter(|(_, it)| seen.insert(**it))
            .map(|(i, it)| (*it, self.revisions.get(i).and_then(|r| r.as_deref())))
            .collect()
    }
}

impl AutomationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: AutomationConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_samples.is_empty() {
            return Err(EvalError::Config("max_samples table is empty".to_string()));
        }
        for (name, model) in &self.models {
            if model.size.is_nan() || model.size <= 0.0 {
                return Err(EvalError::Config(format!("model {name}: size must be positive")));
            }
            match &model.source {
                ModelSource::Megatron(m) if m.frequency == 0 => {
                    return Err(EvalError::Config(format!("model {name}: frequency must be positive")));
                }
                ModelSource::Megatron(m) if m.model_dirs.is_empty() => {
                    return Err(EvalError::Config(format!("model {name}: no model_dirs")));
                }
                ModelSource::Hub(h) if h.revisions.len() > h.iters.len() => {
                    return Err(EvalError::Config(format!(
                        "model {name}: {} revisions for {} iters",
                        h.revisions.len(),
                        h.iters.len()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
