use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Harness output file: `{"results": {task: {metric: value}}, ...}`.
///
/// Only `results` is interpreted; every other field is kept verbatim so the
/// file can be written back. Key order is kept as read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsFile {
    pub results: Map<String, Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Number(f64),
    NotAvailable,
}

impl MetricValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_f64().map(MetricValue::Number).unwrap_or(MetricValue::NotAvailable),
            Value::Bool(b) => MetricValue::Number(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(MetricValue::Number)
                .unwrap_or(MetricValue::NotAvailable),
            _ => MetricValue::NotAvailable,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            MetricValue::NotAvailable => None,
        }
    }
}

/// `acc,none` -> `acc`.
pub fn metric_base_name(metric: &str) -> &str {
    metric.split(',').next().unwrap_or(metric)
}

impl ResultsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        self.serialize(&mut ser)?;
        fs::write(path, out)?;
        Ok(())
    }

    /// Tasks present in the file, regardless of how complete their metrics are.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    /// Metrics of `task` with suffixes stripped. Non-object entries and
    /// non-metric fields such as `alias` are skipped.
    pub fn metrics(&self, task: &str) -> BTreeMap<String, MetricValue> {
        let mut out = BTreeMap::new();
        let Some(Value::Object(obj)) = self.results.get(task) else {
            return out;
        };
        for (name, value) in obj {
            if name == "alias" {
                continue;
            }
            out.insert(metric_base_name(name).to_string(), MetricValue::from_json(value));
        }
        out
    }
}
