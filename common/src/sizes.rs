//! Task weights from the HuggingFace datasets-server.
//!
//! A task name maps to a `(dataset, config)` source through fixed rules. The
//! dataset info responses are fetched once per source and kept in a
//! [`DatasetInfoCache`] that lives as long as one scheduling pass.

use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use tracing::{debug, info};

use crate::error::{EvalError, Result};

pub const DEFAULT_DATASETS_URL: &str = "https://datasets-server.huggingface.co";

/// Task names resolved to a whole dataset (optionally a single config).
const EXACT_SOURCES: &[(&str, &str, Option<&str>)] = &[
    ("hellaswag", "Rowan/hellaswag", Some("default")),
    ("mmlu", "cais/mmlu", None),
    ("winogrande", "allenai/winogrande", Some("winogrande_xl")),
    ("ai2_arc", "allenai/ai2_arc", None),
];

/// `{root}_{config}` task names: the last chunk selects the dataset config.
const UNDERSCORE_SOURCES: &[(&str, &str)] = &[
    ("arc", "alexandrainst/m_arc"),
    ("global_mmlu", "CohereLabs/Global-MMLU"),
    ("hellaswag", "alexandrainst/m_hellaswag"),
    ("include_base_44", "CohereLabs/include-base-44"),
    ("xcopa", "cambridgeltl/xcopa"),
    ("xnli", "facebook/xnli"),
    ("xwinograd", "Muennighoff/xwinograd"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSource {
    pub dataset: String,
    /// `None` sums every config of the dataset.
    pub config: Option<String>,
}

/// Maps a task name to the dataset it is sized from.
pub fn source_for(name: &str) -> Result<DatasetSource> {
    if let Some((_, dataset, config)) = EXACT_SOURCES.iter().find(|(n, _, _)| *n == name) {
        return Ok(DatasetSource {
            dataset: dataset.to_string(),
            config: config.map(str::to_string),
        });
    }

    let Some((root, config)) = name.rsplit_once('_') else {
        return Err(EvalError::Inference(format!(
            "could not infer size for task {name}"
        )));
    };

    let dataset = UNDERSCORE_SOURCES
        .iter()
        .find(|(r, _)| *r == root)
        .map(|(_, d)| d.to_string())
        .ok_or_else(|| EvalError::Inference(format!("could not infer size for task {name}")))?;

    let config = if name.starts_with("include_base_44") {
        title_case(config)
    } else {
        config.to_string()
    };

    Ok(DatasetSource {
        dataset,
        config: Some(config),
    })
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/* ---------------- datasets-server responses ---------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetInfo {
    pub dataset_info: BTreeMap<String, ConfigInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigInfo {
    #[serde(default)]
    pub splits: BTreeMap<String, SplitInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitInfo {
    pub num_examples: u64,
}

impl DatasetInfo {
    /// Row count over every split of `config`, or of every config when `None`.
    pub fn num_examples(&self, config: Option<&str>) -> Result<u64> {
        let configs: Vec<&ConfigInfo> = match config {
            Some(c) => vec![self.dataset_info.get(c).ok_or_else(|| {
                EvalError::Inference(format!("dataset has no config {c}"))
            })?],
            None => self.dataset_info.values().collect(),
        };

        Ok(configs
            .iter()
            .flat_map(|c| c.splits.values())
            .map(|s| s.num_examples)
            .sum())
    }
}

/* ---------------- pass-scoped memo ---------------- */

#[derive(Debug, Default, Clone)]
pub struct DatasetInfoCache {
    infos: HashMap<String, DatasetInfo>,
}

impl DatasetInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset: impl Into<String>, info: DatasetInfo) {
        self.infos.insert(dataset.into(), info);
    }

    pub fn contains(&self, dataset: &str) -> bool {
        self.infos.contains_key(dataset)
    }

    /// Fetches every source needed by `names` that is not cached yet.
    pub async fn warm<'n, I>(&mut self, client: &HubClient, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'n str>,
    {
        for name in names {
            let source = source_for(name)?;
            if self.contains(&source.dataset) {
                continue;
            }
            let info = client.dataset_info(&source.dataset).await?;
            self.insert(source.dataset, info);
        }
        Ok(())
    }

    /// Weight of a task, from cached dataset info only.
    pub fn size_of(&self, name: &str) -> Result<u64> {
        let source = source_for(name)?;
        let info = self.infos.get(&source.dataset).ok_or_else(|| {
            EvalError::Inference(format!(
                "dataset {} for task {name} was not fetched",
                source.dataset
            ))
        })?;
        info.num_examples(source.config.as_deref())
            .map_err(|e| EvalError::Inference(format!("task {name}: {e}")))
    }
}

/* ---------------- HTTP client ---------------- */

/// Base URL of the datasets-server.
/// - `HF_DATASETS_URL` when set (mirrors, tests)
/// - otherwise the public endpoint
pub fn datasets_base_url() -> String {
    env::var("HF_DATASETS_URL").unwrap_or_else(|_| DEFAULT_DATASETS_URL.to_string())
}

#[derive(Debug, Clone)]
pub struct HubClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    /// Client configured from `HF_DATASETS_URL` and `HF_TOKEN`.
    pub fn from_env() -> Self {
        Self::new(datasets_base_url(), env::var("HF_TOKEN").ok())
    }

    pub async fn dataset_info(&self, dataset: &str) -> Result<DatasetInfo> {
        let url = format!("{}/info", self.base_url.trim_end_matches('/'));
        info!("querying dataset info for {}", dataset);

        let mut req = self.http.get(&url).query(&[("dataset", dataset)]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?.error_for_status()?;
        let info: DatasetInfo = resp.json().await?;
        debug!("dataset {} has {} configs", dataset, info.dataset_info.len());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(json: &str) -> DatasetInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn exact_and_underscore_sources() {
        assert_eq!(
            source_for("winogrande").unwrap(),
            DatasetSource {
                dataset: "allenai/winogrande".into(),
                config: Some("winogrande_xl".into()),
            }
        );
        assert_eq!(source_for("mmlu").unwrap().config, None);

        let s = source_for("global_mmlu_de").unwrap();
        assert_eq!(s.dataset, "CohereLabs/Global-MMLU");
        assert_eq!(s.config.as_deref(), Some("de"));

        let s = source_for("include_base_44_german").unwrap();
        assert_eq!(s.dataset, "CohereLabs/include-base-44");
        assert_eq!(s.config.as_deref(), Some("German"));
    }

    #[test]
    fn unknown_tasks_fail_loudly() {
        assert!(matches!(source_for("gsm8k"), Err(EvalError::Inference(_))));
        assert!(matches!(source_for("foo_bar"), Err(EvalError::Inference(_))));
    }

    #[test]
    fn num_examples_sums_splits() {
        let i = info(
            r#"{"dataset_info": {
                "a": {"splits": {"test": {"num_examples": 10}, "validation": {"num_examples": 5}}},
                "b": {"splits": {"test": {"num_examples": 7}}}
            }}"#,
        );
        assert_eq!(i.num_examples(Some("a")).unwrap(), 15);
        assert_eq!(i.num_examples(None).unwrap(), 22);
        assert!(i.num_examples(Some("c")).is_err());
    }

    /// The cache answers only from fetched data; a missing dataset is an error.
    #[test]
    fn cache_lookup_requires_prefetched_dataset() {
        let mut cache = DatasetInfoCache::new();
        assert!(cache.size_of("xnli_fr").is_err());

        cache.insert(
            "facebook/xnli",
            info(r#"{"dataset_info": {"fr": {"splits": {"test": {"num_examples": 5010}}}}}"#),
        );
        assert_eq!(cache.size_of("xnli_fr").unwrap(), 5010);
        assert!(cache.size_of("xnli_de").is_err());
    }
}
