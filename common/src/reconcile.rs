//! Which catalog tasks still need a job for one `(model, iteration)`.
//!
//! Handled names are the completed results plus everything implied by queued
//! jobs. A queued `mixed` job is assumed to cover the whole catalog: its task
//! list is not recoverable from the job name, and assuming full coverage is
//! what keeps a task from being submitted twice while that job is queued.

use std::collections::HashSet;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{EvalError, Result};
use crate::label::JobLabel;
use crate::partition::Partition;
use crate::state::{CompletedTasks, RunningJobs};
use crate::task::Task;

pub struct Reconciler<'c, 'a> {
    model: &'c str,
    catalog: &'a Catalog,
    canonical: &'c Partition<'a>,
    forced: HashSet<&'c str>,
}

impl<'c, 'a> Reconciler<'c, 'a> {
    pub fn new(model: &'c str, catalog: &'a Catalog, canonical: &'c Partition<'a>) -> Self {
        Self {
            model,
            catalog,
            canonical,
            forced: HashSet::new(),
        }
    }

    /// Task names reported missing no matter what was handled.
    pub fn with_forced<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = &'c str>,
    {
        self.forced.extend(names);
        self
    }

    fn drift(&self, running: usize) -> EvalError {
        EvalError::ConfigurationDrift {
            model: self.model.to_string(),
            running,
            expected: self.canonical.len(),
        }
    }

    /// Checks every queued label of the model against the canonical shard count.
    pub fn check_drift(&self, running: &RunningJobs) -> Result<()> {
        let Some(iterations) = running.for_model(self.model) else {
            return Ok(());
        };
        for label in iterations.values().flatten() {
            if let JobLabel::Shard { index, count } = *label {
                if count != self.canonical.len() || index >= count {
                    return Err(self.drift(count));
                }
            }
        }
        Ok(())
    }

    /// Missing tasks at `iteration`, in catalog order.
    pub fn missing(
        &self,
        iteration: u64,
        running: &RunningJobs,
        completed: &CompletedTasks,
    ) -> Result<Vec<&'a Task>> {
        let mut handled: HashSet<&str> = completed
            .get(&iteration)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default();

        for label in running.labels(self.model, iteration) {
            match *label {
                JobLabel::Mixed => {
                    handled.extend(self.catalog.iter().flat_map(|t| t.completion_markers()));
                }
                JobLabel::Shard { index, count } => {
                    if count != self.canonical.len() {
                        return Err(self.drift(count));
                    }
                    let shard = self.canonical.shard(index).ok_or_else(|| self.drift(count))?;
                    handled.extend(shard.tasks().iter().flat_map(|t| t.completion_markers()));
                }
            }
        }

        let missing: Vec<&'a Task> = self
            .catalog
            .iter()
            .filter(|task| {
                self.forced.contains(task.name.as_str())
                    || task.completion_markers().any(|m| !handled.contains(m))
            })
            .collect();

        debug!(
            "{} iter {}: {} of {} tasks missing",
            self.model,
            iteration,
            missing.len(),
            self.catalog.len()
        );
        Ok(missing)
    }
}

/// Missing tasks for `(model, iteration)` given one snapshot of cluster state.
pub fn missing<'a>(
    model: &str,
    iteration: u64,
    catalog: &'a Catalog,
    running: &RunningJobs,
    completed: &CompletedTasks,
    canonical: &Partition<'a>,
) -> Result<Vec<&'a Task>> {
    Reconciler::new(model, catalog, canonical).missing(iteration, running, completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::JobName;
    use crate::partition::partition;
    use crate::task::{Dimension, TaskKind};
    use std::collections::BTreeSet;

    fn task(name: &str, weight: u64, aliases: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            weight,
            kinds: BTreeSet::from([TaskKind::Pretrain]),
            language: None,
            dimension: Dimension::GeneralAbilities,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn catalog() -> Catalog {
        Catalog::from_tasks(vec![
            task("T1", 100, &[]),
            task("T2", 90, &[]),
            task("T3", 10, &[]),
        ])
        .unwrap()
    }

    fn completed(it: u64, names: &[&str]) -> CompletedTasks {
        let mut c = CompletedTasks::new();
        c.insert(it, names.iter().map(|n| n.to_string()).collect());
        c
    }

    fn running(names: &[&str]) -> RunningJobs {
        RunningJobs::from_names(names.iter().copied())
    }

    fn names(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn nothing_done_means_everything_missing() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        let out = missing("m", 5, &cat, &RunningJobs::default(), &CompletedTasks::new(), &canon).unwrap();
        assert_eq!(names(&out), vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn completed_tasks_are_subtracted_in_catalog_order() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        let out = missing("m", 5, &cat, &RunningJobs::default(), &completed(5, &["T2"]), &canon).unwrap();
        assert_eq!(names(&out), vec!["T1", "T3"]);

        // other iterations do not count
        let out = missing("m", 6, &cat, &RunningJobs::default(), &completed(5, &["T2"]), &canon).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn mixed_job_covers_the_whole_catalog() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        let run = running(&["eval_m_mixed_5"]);

        let out = missing("m", 5, &cat, &run, &CompletedTasks::new(), &canon).unwrap();
        assert!(out.is_empty());

        // other model or iteration unaffected
        assert_eq!(missing("m", 6, &cat, &run, &CompletedTasks::new(), &canon).unwrap().len(), 3);
        assert_eq!(missing("n", 5, &cat, &run, &CompletedTasks::new(), &canon).unwrap().len(), 3);
    }

    #[test]
    fn canonical_shard_job_covers_its_tasks() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        // shard 1 = {T2, T3}
        let run = running(&["eval_m_shard1of2_5"]);
        let out = missing("m", 5, &cat, &run, &CompletedTasks::new(), &canon).unwrap();
        assert_eq!(names(&out), vec!["T1"]);
    }

    #[test]
    fn shard_count_mismatch_is_drift() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        let run = running(&["eval_m_shard0of3_5"]);

        let err = missing("m", 5, &cat, &run, &CompletedTasks::new(), &canon).unwrap_err();
        assert!(matches!(
            err,
            EvalError::ConfigurationDrift { running: 3, expected: 2, .. }
        ));

        let rec = Reconciler::new("m", &cat, &canon);
        assert!(rec.check_drift(&run).is_err());
        assert!(rec.check_drift(&running(&["eval_m_shard1of2_5", "eval_m_mixed_9"])).is_ok());
        assert!(rec.check_drift(&running(&["eval_m_shard2of2_5"])).is_err());
    }

    #[test]
    fn aliases_must_all_be_handled() {
        let cat = Catalog::from_tasks(vec![task("blend", 10, &["a", "b"])]).unwrap();
        let canon = partition(&cat.refs(), 1).unwrap();
        let none = RunningJobs::default();

        let out = missing("m", 1, &cat, &none, &completed(1, &["a"]), &canon).unwrap();
        assert_eq!(names(&out), vec!["blend"]);

        let out = missing("m", 1, &cat, &none, &completed(1, &["a", "b"]), &canon).unwrap();
        assert!(out.is_empty());

        // the task's own name is not a marker once it has aliases
        let out = missing("m", 1, &cat, &none, &completed(1, &["blend"]), &canon).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn running_shard_marks_alias_names() {
        let cat = Catalog::from_tasks(vec![task("blend", 10, &["a", "b"]), task("T1", 5, &[])]).unwrap();
        let canon = partition(&cat.refs(), 2).unwrap();
        let run = running(&["eval_m_shard0of2_1"]);
        let out = missing("m", 1, &cat, &run, &CompletedTasks::new(), &canon).unwrap();
        assert_eq!(names(&out), vec!["T1"]);
    }

    #[test]
    fn empty_result_is_idempotent() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        let done = completed(5, &["T1", "T2", "T3"]);
        let none = RunningJobs::default();
        assert!(missing("m", 5, &cat, &none, &done, &canon).unwrap().is_empty());
        assert!(missing("m", 5, &cat, &none, &done, &canon).unwrap().is_empty());
    }

    #[test]
    fn forced_tasks_are_always_missing() {
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        let done = completed(5, &["T1", "T2", "T3"]);
        let rec = Reconciler::new("m", &cat, &canon).with_forced(["T2"]);
        let out = rec.missing(5, &RunningJobs::default(), &done).unwrap();
        assert_eq!(names(&out), vec!["T2"]);
    }

    #[test]
    fn job_names_feed_labels() {
        let mut run = RunningJobs::default();
        run.insert(JobName::new("m", JobLabel::Mixed, 5));
        let cat = catalog();
        let canon = partition(&cat.refs(), 2).unwrap();
        assert!(missing("m", 5, &cat, &run, &CompletedTasks::new(), &canon).unwrap().is_empty());
    }
}
