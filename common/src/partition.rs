//! Greedy multiway partitioning of weighted tasks.
//!
//! Tasks are taken heaviest first (ties by name) and each goes to the shard
//! with the smallest running total (ties by shard index). The result is
//! deterministic and satisfies `max - min <= max task weight`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{EvalError, Result};
use crate::task::Task;

/// A group of catalog tasks submitted as one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shard<'a> {
    tasks: Vec<&'a Task>,
    weight: u64,
}

impl<'a> Shard<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: &'a Task) {
        self.weight += task.weight;
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[&'a Task] {
        &self.tasks
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<&'a str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }
}

impl<'a> FromIterator<&'a Task> for Shard<'a> {
    fn from_iter<I: IntoIterator<Item = &'a Task>>(iter: I) -> Self {
        let mut shard = Shard::new();
        for task in iter {
            shard.push(task);
        }
        shard
    }
}

/// Ordered, pairwise disjoint shards covering the partitioned input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition<'a> {
    shards: Vec<Shard<'a>>,
}

impl<'a> Partition<'a> {
    pub fn shards(&self) -> &[Shard<'a>] {
        &self.shards
    }

    pub fn shard(&self, index: usize) -> Option<&Shard<'a>> {
        self.shards.get(index)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Shard<'a>> {
        self.shards.iter()
    }

    /// Heaviest minus lightest shard weight.
    pub fn imbalance(&self) -> u64 {
        let max = self.shards.iter().map(Shard::weight).max().unwrap_or(0);
        let min = self.shards.iter().map(Shard::weight).min().unwrap_or(0);
        max - min
    }
}

/// Splits `tasks` into exactly `shard_count` balanced shards.
///
/// Fails on `shard_count == 0` and on an empty input; use
/// [`partition_allowing_empty`] when empty shards are acceptable.
pub fn partition<'a>(tasks: &[&'a Task], shard_count: usize) -> Result<Partition<'a>> {
    if tasks.is_empty() {
        return Err(EvalError::InvalidArgument(format!(
            "cannot partition an empty task set into {shard_count} shards"
        )));
    }
    partition_allowing_empty(tasks, shard_count)
}

/// Like [`partition`], but an empty input yields `shard_count` empty shards.
pub fn partition_allowing_empty<'a>(
    tasks: &[&'a Task],
    shard_count: usize,
) -> Result<Partition<'a>> {
    if shard_count == 0 {
        return Err(EvalError::InvalidArgument(
            "shard count must be at least 1".to_string(),
        ));
    }

    if shard_count == 1 {
        return Ok(Partition {
            shards: vec![tasks.iter().copied().collect()],
        });
    }

    let mut order: Vec<&'a Task> = tasks.to_vec();
    order.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

    let mut shards: Vec<Shard<'a>> = (0..shard_count).map(|_| Shard::new()).collect();

    // min-heap keyed by (total weight, shard index)
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> =
        (0..shard_count).map(|i| Reverse((0, i))).collect();

    for task in order {
        let Some(Reverse((_, idx))) = heap.pop() else {
            break;
        };
        shards[idx].push(task);
        heap.push(Reverse((shards[idx].weight(), idx)));
    }

    Ok(Partition { shards })
}

/// `ceil(total / budget)`, never below one.
pub fn shards_needed(total_weight: u64, budget: u64) -> Result<usize> {
    if budget == 0 {
        return Err(EvalError::InvalidArgument(
            "per-job budget must be positive".to_string(),
        ));
    }
    Ok(total_weight.div_ceil(budget).max(1) as usize)
}
