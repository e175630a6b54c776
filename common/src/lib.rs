//! Evaluation scheduling core: the task catalog, its balanced partitioning, and
//! the reconciliation of wanted work against cluster state.

/* --------- Catalog --------- */

pub mod catalog;
pub mod sizes;
pub mod task;

/* --------- Partitioning and job naming --------- */

pub mod canonical;
pub mod label;
pub mod partition;

/* --------- Cluster state, reconciliation, dispatch --------- */

pub mod dispatch;
pub mod reconcile;
pub mod state;

/* --------- Configuration, results, housekeeping --------- */

pub mod aggregate;
pub mod checkpoints;
pub mod config;
pub mod error;
pub mod results;

pub use catalog::{Catalog, CatalogConfig};
pub use canonical::{canonical_shard_count, CanonicalCache, SizeClassTable};
pub use config::{AutomationConfig, ModelConfig, ModelSource};
pub use dispatch::{dispatch, resolve_checkpoint, JobSubmission, SubmissionTarget};
pub use error::{EvalError, Result};
pub use label::{JobLabel, JobName};
pub use partition::{partition, partition_allowing_empty, Partition, Shard};
pub use reconcile::{missing, Reconciler};
pub use state::{CompletedTasks, RunningJobs};
pub use task::{Dimension, Task, TaskKind};
