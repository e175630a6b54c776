use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::error::{EvalError, Result};
use crate::partition::{partition, shards_needed, Partition};

/// Minimum model size (billions of parameters) → maximum task weight per job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SizeClassTable(BTreeMap<u64, u64>);

impl SizeClassTable {
    pub fn new(tiers: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self(tiers.into_iter().collect())
    }

    /// Budget of the largest tier whose threshold is <= `model_size`.
    ///
    /// Falls back to the smallest tier when the model is below every threshold.
    pub fn max_samples(&self, model_size: f64) -> Result<u64> {
        let (&smallest_threshold, &smallest_budget) = self.0.iter().next().ok_or_else(|| {
            EvalError::Config("max_samples table is empty".to_string())
        })?;

        let budget = match self
            .0
            .iter()
            .rev()
            .find(|(threshold, _)| (**threshold as f64) <= model_size)
        {
            Some((_, budget)) => *budget,
            None => {
                warn!(
                    "model size {} is below every max_samples tier, using the {} tier",
                    model_size, smallest_threshold
                );
                smallest_budget
            }
        };

        if budget == 0 {
            return Err(EvalError::Config(format!(
                "max_samples budget for model size {model_size} is zero"
            )));
        }
        Ok(budget)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Number of canonical shards for the whole catalog under `budget`.
pub fn canonical_shard_count(catalog: &Catalog, budget: u64) -> Result<usize> {
    shards_needed(catalog.total_weight(), budget)
}

/// Memo of the whole-catalog partition per shard count, for one pass.
///
/// Recomputing for the same count is deterministic, so jobs submitted in earlier
/// passes under a canonical label map back to the same tasks.
#[derive(Debug)]
pub struct CanonicalCache<'a> {
    catalog: &'a Catalog,
    partitions: HashMap<usize, Partition<'a>>,
}

impl<'a> CanonicalCache<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            partitions: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    pub fn canonical(&mut self, shard_count: usize) -> Result<&Partition<'a>> {
        match self.partitions.entry(shard_count) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!(
                    "computing canonical partition of {} tasks into {} shards",
                    self.catalog.len(),
                    shard_count
                );
                let p = partition(&self.catalog.refs(), shard_count)?;
                Ok(entry.insert(p))
            }
        }
    }

    pub fn cached_counts(&self) -> usize {
        self.partitions.len()
    }
}
