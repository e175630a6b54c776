use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{EvalError, Result};
use crate::sizes::DatasetInfoCache;
use crate::task::{infer_language, Dimension, Task, TaskKind};

/// `all_tasks.json`: tasks whose metadata is inferred, grouped by kind, plus
/// fully specified records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub infer: InferLists,
    #[serde(default)]
    pub other: Vec<TaskRecord>,
}

/// `"infer": {"pretrain": [...], "posttrain": [...]}`, kept in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferLists(pub Vec<(TaskKind, Vec<String>)>);

impl InferLists {
    pub fn iter(&self) -> impl Iterator<Item = (TaskKind, &[String])> {
        self.0.iter().map(|(kind, names)| (*kind, names.as_slice()))
    }

    /// Every inferred name once, in first-seen order.
    pub fn names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.iter()
            .flat_map(|(_, names)| names.iter().map(String::as_str))
            .filter(|n| seen.insert(*n))
            .collect()
    }
}

impl Serialize for InferLists {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (kind, names) in &self.0 {
            map.serialize_entry(kind, names)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for InferLists {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ListsVisitor;

        impl<'de> Visitor<'de> for ListsVisitor {
            type Value = InferLists;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from task kind to task names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut lists = Vec::new();
                while let Some((kind, names)) = access.next_entry::<TaskKind, Vec<String>>()? {
                    lists.push((kind, names));
                }
                Ok(InferLists(lists))
            }
        }

        deserializer.deserialize_map(ListsVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub kinds: Vec<TaskKind>,
    /// Inferred from the datasets-server when absent.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub dimension: Option<Dimension>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CatalogConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            EvalError::Config(format!("cannot read task catalog {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Names whose weight must come from the datasets-server.
    pub fn names_needing_size(&self) -> Vec<&str> {
        let without_size = self
            .other
            .iter()
            .filter(|r| r.size.is_none())
            .map(|r| r.name.as_str());
        self.infer.names().into_iter().chain(without_size).collect()
    }
}

/// Ordered, name-unique set of tasks for one scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tasks: Vec<Task>,
}

impl Catalog {
    /// Builds the catalog, resolving missing weights from `sizes`.
    ///
    /// A name listed under several `infer` kinds becomes one task carrying all
    /// of them. Any other duplicate name, bad alias list or failed inference
    /// aborts construction.
    pub fn build(config: &CatalogConfig, sizes: &DatasetInfoCache) -> Result<Self> {
        let mut tasks: Vec<Task> = Vec::new();
        let mut inferred: HashMap<&str, usize> = HashMap::new();

        for (kind, names) in config.infer.iter() {
            let mut listed = HashSet::new();
            for name in names {
                if !listed.insert(name.as_str()) {
                    return Err(EvalError::CatalogInconsistency(format!(
                        "task {name} listed twice under {kind}"
                    )));
                }
                if let Some(&at) = inferred.get(name.as_str()) {
                    tasks[at].kinds.insert(kind);
                    continue;
                }
                inferred.insert(name.as_str(), tasks.len());
                tasks.push(Task {
                    name: name.clone(),
                    weight: sizes.size_of(name)?,
                    kinds: BTreeSet::from([kind]),
                    language: Some(infer_language(name)),
                    dimension: Dimension::infer(name)?,
                    aliases: Vec::new(),
                });
            }
        }

        for row in &config.other {
            let weight = match row.size {
                Some(size) => size,
                None => sizes.size_of(&row.name)?,
            };
            let dimension = match row.dimension {
                Some(d) => d,
                None => Dimension::infer(&row.name)?,
            };
            tasks.push(Task {
                name: row.name.clone(),
                weight,
                kinds: row.kinds.iter().copied().collect(),
                language: Some(
                    row.language
                        .clone()
                        .unwrap_or_else(|| infer_language(&row.name)),
                ),
                dimension,
                aliases: row.aliases.clone(),
            });
        }

        Self::from_tasks(tasks)
    }

    /// Validates and wraps already resolved tasks.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.name.as_str()) {
                return Err(EvalError::CatalogInconsistency(format!(
                    "duplicate task name {}",
                    task.name
                )));
            }
            if task.weight == 0 {
                return Err(EvalError::CatalogInconsistency(format!(
                    "task {} has zero weight",
                    task.name
                )));
            }
            if task.kinds.is_empty() {
                return Err(EvalError::CatalogInconsistency(format!(
                    "task {} has no kind",
                    task.name
                )));
            }

            let mut aliases = HashSet::new();
            for alias in &task.aliases {
                if alias.trim().is_empty() || !aliases.insert(alias.as_str()) {
                    return Err(EvalError::CatalogInconsistency(format!(
                        "task {} has an empty or repeated alias {:?}",
                        task.name, alias
                    )));
                }
            }
        }
        Ok(Self { tasks })
    }

    /// Catalog without the tasks whose name contains any of `patterns`.
    pub fn excluding(&self, patterns: &[String]) -> Self {
        let tasks = self
            .tasks
            .iter()
            .filter(|t| patterns.iter().all(|p| !t.name.contains(p.as_str())))
            .cloned()
            .collect();
        Self { tasks }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.tasks.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.tasks.iter().map(|t| t.weight).sum()
    }

    /// Borrowed view in catalog order, the input shape of the partitioner.
    pub fn refs(&self) -> Vec<&Task> {
        self.tasks.iter().collect()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}
