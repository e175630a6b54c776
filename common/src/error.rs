use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A running job encodes a shard count different from the one computed now.
    #[error(
        "configuration drift for model {model}: running job uses {running} shards, \
         canonical partition has {expected}"
    )]
    ConfigurationDrift {
        model: String,
        running: usize,
        expected: usize,
    },

    #[error("model {model} has {} checkpoint paths for iter {iteration} (should be 1): {candidates:?}", .candidates.len())]
    PathResolution {
        model: String,
        iteration: u64,
        candidates: Vec<PathBuf>,
    },

    #[error("malformed job name: {0}")]
    MalformedJobName(String),

    #[error("inconsistent task catalog: {0}")]
    CatalogInconsistency(String),

    #[error("could not infer metadata: {0}")]
    Inference(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    /// A directory under the results tree could not be listed.
    #[error("cannot scan {}: {}", .0.path().display(), .0.error())]
    GlobWalk(#[from] glob::GlobError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, EvalError>;
