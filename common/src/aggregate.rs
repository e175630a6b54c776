//! Regional aggregates over per-language harness results.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;
use crate::results::{MetricValue, ResultsFile};
use crate::task::Dimension;

pub const SWISS_LANGS: &[&str] = &["German", "French", "Italian", "Romansh"];

pub const EU_LANGS: &[&str] = &[
    "Albanian", "Armenian", "Basque", "Belarusian", "Bulgarian", "Catalan",
    "Croatian", "Czech", "Danish", "Dutch", "English", "Estonian", "Finnish",
    "French", "Georgian", "German", "Greek", "Hungarian", "Italian",
    "Lithuanian", "North Macedonian", "Polish", "Portuguese", "Romanian",
    "Romansh", "Russian", "Serbian", "Slovak", "Spanish", "Swedish",
    "Ukrainian",
];

/// Mean of every numeric metric over `tasks`. Booleans count as 1 or 0.
/// Unknown tasks and non-numeric values are ignored; metric names are kept as
/// they appear. A mean JSON cannot hold (`NaN`, infinities) is written as a string.
pub fn aggregate_metrics<S: AsRef<str>>(tasks: &[S], results: &Map<String, Value>) -> Map<String, Value> {
    let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();

    for task in tasks {
        let Some(Value::Object(metrics)) = results.get(task.as_ref()) else {
            continue;
        };
        for (metric, value) in metrics {
            if let Some(v) = MetricValue::from_json(value).as_f64() {
                values.entry(metric.as_str()).or_default().push(v);
            }
        }
    }

    values
        .into_iter()
        .map(|(metric, vals)| {
            let mean = vals.iter().sum::<f64>() / vals.len() as f64;
            let value = Number::from_f64(mean).map(Value::Number).unwrap_or_else(|| {
                warn!("mean of {} is {}", metric, mean);
                Value::String(mean.to_string())
            });
            (metric.to_string(), value)
        })
        .collect()
}

/// Language names of a benchmark description file: the keys of its top-level object.
pub fn load_language_names(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)?;
    let obj: Map<String, Value> = serde_json::from_str(&raw)?;
    Ok(obj.keys().cloned().collect())
}

/// Adds `{dimension}_{swiss|eu|global}` entries averaging the
/// `{dimension}_{language}` results. Returns the names that were added.
pub fn add_regional_aggregates(file: &mut ResultsFile, all_languages: &[String]) -> Vec<String> {
    let groups: [(&str, Vec<&str>); 3] = [
        ("swiss", SWISS_LANGS.to_vec()),
        ("eu", EU_LANGS.to_vec()),
        ("global", all_languages.iter().map(String::as_str).collect()),
    ];

    let mut added = Vec::new();
    for dimension in Dimension::ALL {
        for (tag, langs) in &groups {
            let tasks: Vec<String> = langs
                .iter()
                .map(|lang| format!("{}_{}", dimension.as_str(), lang.to_lowercase()))
                .collect();
            let mut agg = aggregate_metrics(&tasks, &file.results);
            let metric_count = agg.len();

            let name = format!("{}_{}", dimension.as_str(), tag);
            agg.insert("alias".to_string(), Value::String(name.clone()));
            file.results.insert(name.clone(), Value::Object(agg));
            info!("added {} ({} tasks, {} metrics)", name, tasks.len(), metric_count);
            added.push(name);
        }
    }
    added
}
