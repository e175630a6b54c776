use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use common::checkpoints::{self, MigrationSummary};
use common::config::{ModelConfig, ModelSource};
use common::state::{available_iterations, scan_completed};
use common::{
    canonical_shard_count, dispatch, resolve_checkpoint, AutomationConfig, CanonicalCache, Catalog,
    JobSubmission, Reconciler, RunningJobs, SubmissionTarget,
};

use crate::slurm::BatchScheduler;

/// What one scheduling pass did.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub submitted: Vec<String>,
    pub failed: Vec<String>,
    /// Model -> reason. No job was submitted for these models.
    pub skipped_models: BTreeMap<String, String>,
    /// `(model, iteration, reason)`.
    pub skipped_iterations: Vec<(String, u64, String)>,
    pub migration: Option<MigrationSummary>,
    pub retention_removed: usize,
}

impl PassReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            submitted: Vec::new(),
            failed: Vec::new(),
            skipped_models: BTreeMap::new(),
            skipped_iterations: Vec::new(),
            migration: None,
            retention_removed: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ModelPlan {
    submissions: Vec<JobSubmission>,
    skipped_iterations: Vec<(u64, String)>,
}

/// Decides every submission for one model. Any error skips the whole model.
fn plan_model<'a>(
    cfg: &AutomationConfig,
    name: &str,
    model: &ModelConfig,
    catalog: &'a Catalog,
    cache: &mut CanonicalCache<'a>,
    running: &RunningJobs,
    force_tasks: &[String],
) -> common::Result<ModelPlan> {
    // canonical layout for this model's size class
    let budget = cfg.max_samples.max_samples(model.size)?;
    let shard_count = canonical_shard_count(catalog, budget)?;
    let canonical = cache.canonical(shard_count)?;
    let completed = scan_completed(&cfg.logs_root, name)?;

    let reconciler = Reconciler::new(name, catalog, canonical)
        .with_forced(force_tasks.iter().map(String::as_str));
    reconciler.check_drift(running)?;

    let target = |checkpoint: String, iteration: u64, extra_env: BTreeMap<String, String>| SubmissionTarget {
        model: name.to_string(),
        checkpoint,
        iteration,
        tokens_per_iter: model.tokens_per_iter.clone(),
        model_size: model.size,
        logs_root: cfg.logs_root.clone(),
        extra_env,
    };

    let mut plan = ModelPlan::default();
    match &model.source {
        ModelSource::Megatron(src) => {
            let available = available_iterations(&src.model_dirs);
            for it in src.eval_iterations(&available) {
                let missing = reconciler.missing(it, running, &completed)?;
                if missing.is_empty() {
                    continue;
                }
                let dir = match resolve_checkpoint(name, &src.model_dirs, it) {
                    Ok(dir) => dir,
                    Err(e) => {
                        error!("{}", e);
                        plan.skipped_iterations.push((it, e.to_string()));
                        continue;
                    }
                };

                let mut env = model.extra_env.clone();
                if let Some(tmp) = &cfg.hf_temp_dir {
                    env.insert("HF_TEMP_DIR".to_string(), tmp.display().to_string());
                }
                let t = target(dir.display().to_string(), it, env);
                plan.submissions.extend(dispatch(&t, &missing, canonical, budget)?);
            }
        }
        ModelSource::Hub(src) => {
            for (it, revision) in src.checkpoints() {
                let missing = reconciler.missing(it, running, &completed)?;
                if missing.is_empty() {
                    continue;
                }
                let mut env = model.extra_env.clone();
                if let Some(rev) = revision {
                    env.insert("REVISION".to_string(), rev.to_string());
                }
                let t = target(src.name.clone(), it, env);
                let mut jobs = dispatch(&t, &missing, canonical, budget)?;
                for job in &mut jobs {
                    job.hub_checkpoint = true;
                }
                plan.submissions.extend(jobs);
            }
        }
    }

    Ok(plan)
}

/// One full pass: list jobs, reconcile every model, submit, then tidy up
/// converted checkpoints.
pub async fn run_pass<S: BatchScheduler>(
    cfg: &AutomationConfig,
    catalog: &Catalog,
    scheduler: &S,
    force_tasks: &[String],
) -> anyhow::Result<PassReport> {
    let mut report = PassReport::new();

    // 1) One queue listing for the whole pass
    let running = scheduler.active_jobs().await?;
    info!(
        "pass started: {} tasks in catalog, {} evaluation jobs queued",
        catalog.len(),
        running.len()
    );

    let mut cache = CanonicalCache::new(catalog);

    // 2) Plan each model on its own; an error only skips that model
    for (name, model) in &cfg.models {
        let plan = match plan_model(cfg, name, model, catalog, &mut cache, &running, force_tasks) {
            Ok(plan) => plan,
            Err(e) => {
                error!("skipping model {}: {}", name, e);
                report.skipped_models.insert(name.clone(), e.to_string());
                continue;
            }
        };

        report.skipped_iterations.extend(
            plan.skipped_iterations
                .into_iter()
                .map(|(it, reason)| (name.clone(), it, reason)),
        );

        // 3) Submit; a rejected job is reported and the rest go ahead
        for job in &plan.submissions {
            match scheduler.submit(job).await {
                Ok(()) => {
                    info!("launched {}", job.name);
                    report.submitted.push(job.job_name());
                }
                Err(e) => {
                    error!("submission of {} failed: {:#}", job.name, e);
                    report.failed.push(job.job_name());
                }
            }
        }
    }

    // 4) Move and prune converted checkpoints
    housekeeping(cfg, scheduler, &mut report).await;

    report.finished_at = Some(Utc::now());
    info!(
        "pass finished: {} submitted, {} failed, {} models skipped",
        report.submitted.len(),
        report.failed.len(),
        report.skipped_models.len()
    );
    Ok(report)
}

async fn housekeeping<S: BatchScheduler>(cfg: &AutomationConfig, scheduler: &S, report: &mut PassReport) {
    let Some(storage) = &cfg.hf_storage_dir else {
        return;
    };

    if let Some(tmp) = &cfg.hf_temp_dir {
        // fresh listing: jobs submitted above must not lose their outputs
        match scheduler.active_jobs().await {
            Ok(running) => match checkpoints::migrate(tmp, storage, &running) {
                Ok(summary) => report.migration = Some(summary),
                Err(e) => warn!("checkpoint migration failed: {}", e),
            },
            Err(e) => warn!("skipping checkpoint migration: {:#}", e),
        }
    }

    let models: Vec<&str> = cfg.models.keys().map(String::as_str).collect();
    match checkpoints::retain(storage, &models, cfg.num_hf_checkpoints_to_keep) {
        Ok(removed) => report.retention_removed = removed.len(),
        Err(e) => warn!("checkpoint retention failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use common::{Dimension, Task, TaskKind};
    use std::collections::BTreeSet;
    use std::env;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Records submissions instead of talking to a cluster.
    #[derive(Default)]
    struct FakeScheduler {
        queue: Vec<String>,
        submitted: Mutex<Vec<JobSubmission>>,
        reject: Option<String>,
    }

    impl FakeScheduler {
        fn with_queue(names: &[&str]) -> Self {
            Self {
                queue: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }

        fn submitted(&self) -> Vec<JobSubmission> {
            self.submitted.lock().unwrap().clone()
        }
    }

    impl BatchScheduler for FakeScheduler {
        async fn active_jobs(&self) -> anyhow::Result<RunningJobs> {
            Ok(RunningJobs::from_names(&self.queue))
        }

        async fn submit(&self, job: &JobSubmission) -> anyhow::Result<()> {
            if self.reject.as_deref() == Some(job.job_name().as_str()) {
                bail!("rejected");
            }
            self.submitted.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("pass_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn catalog() -> Catalog {
        let task = |name: &str, weight| Task {
            name: name.to_string(),
            weight,
            kinds: BTreeSet::from([TaskKind::Pretrain]),
            language: None,
            dimension: Dimension::GeneralAbilities,
            aliases: Vec::new(),
        };
        Catalog::from_tasks(vec![task("A", 100), task("B", 90), task("C", 10)]).unwrap()
    }

    fn config(logs: &Path, models: &str) -> AutomationConfig {
        AutomationConfig::from_json(&format!(
            r#"{{"logs_root": {:?}, "max_samples": {{"1": 105}}, "models": {{{}}}}}"#,
            logs.display().to_string(),
            models
        ))
        .unwrap()
    }

    fn names(jobs: &[JobSubmission]) -> Vec<String> {
        jobs.iter().map(|j| j.job_name()).collect()
    }

    const HUB: &str = r#""m": {"tokens_per_iter": "1", "name": "org/m", "iters": [5]}"#;

    #[tokio::test]
    async fn fresh_checkpoint_gets_canonical_shards() {
        let root = temp_dir("fresh");
        let cfg = config(&root, HUB);
        let cat = catalog();
        let slurm = FakeScheduler::default();

        let report = run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        assert_eq!(names(&slurm.submitted()), vec!["eval_m_shard0of2_5", "eval_m_shard1of2_5"]);
        assert_eq!(report.submitted.len(), 2);
        assert_eq!(slurm.submitted()[1].env["TASKS"], "B,C");
        assert_eq!(slurm.submitted()[0].checkpoint, "org/m");
        assert!(slurm.submitted().iter().all(|j| j.hub_checkpoint));
    }

    #[tokio::test]
    async fn queued_mixed_job_blocks_resubmission() {
        let root = temp_dir("mixed");
        let cfg = config(&root, HUB);
        let cat = catalog();
        let slurm = FakeScheduler::with_queue(&["eval_m_mixed_5"]);

        run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        assert!(slurm.submitted().is_empty());
    }

    #[tokio::test]
    async fn drift_skips_only_that_model() {
        let root = temp_dir("drift");
        let models = format!(
            "{HUB}, {}",
            r#""n": {"tokens_per_iter": "1", "name": "org/n", "iters": [1]}"#
        );
        let cfg = config(&root, &models);
        let cat = catalog();
        let slurm = FakeScheduler::with_queue(&["eval_m_shard0of3_9"]);

        let report = run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        assert!(report.skipped_models.contains_key("m"));
        assert_eq!(names(&slurm.submitted()), vec!["eval_n_shard0of2_1", "eval_n_shard1of2_1"]);
    }

    #[tokio::test]
    async fn completed_results_leave_a_mixed_remainder() {
        let root = temp_dir("partial");
        let run_dir = root.join("m/iter_0000005/harness/eval_0/run");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("results.json"), r#"{"results": {"B": {}}}"#).unwrap();

        let cfg = config(&root, HUB);
        let cat = catalog();
        let slurm = FakeScheduler::default();

        run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        let subs = slurm.submitted();
        assert_eq!(names(&subs), vec!["eval_m_shard0of2_5", "eval_m_mixed_5"]);
        assert_eq!(subs[1].tasks, vec!["C"]);
    }

    #[tokio::test]
    async fn ambiguous_checkpoint_skips_iteration() {
        let root = temp_dir("ambiguous");
        let (a, b) = (root.join("ckpt_a"), root.join("ckpt_b"));
        fs::create_dir_all(a.join("iter_0000100")).unwrap();
        fs::create_dir_all(b.join("iter_0000100")).unwrap();
        fs::create_dir_all(a.join("iter_0000200")).unwrap();

        let models = format!(
            r#""mg": {{"tokens_per_iter": 4, "model_dirs": [{:?}, {:?}], "frequency": 100}}"#,
            a.display().to_string(),
            b.display().to_string()
        );
        let cfg = config(&root.join("logs"), &models);
        let cat = catalog();
        let slurm = FakeScheduler::default();

        let report = run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        assert_eq!(report.skipped_iterations.len(), 1);
        assert_eq!(report.skipped_iterations[0].1, 100);
        let subs = slurm.submitted();
        assert!(subs.iter().all(|s| s.iteration == 200));
        assert_eq!(subs[0].checkpoint, a.display().to_string());
        // training checkpoints never get the official image
        assert!(subs.iter().all(|s| !s.hub_checkpoint));
    }

    #[tokio::test]
    async fn revisions_apply_to_their_iteration_only() {
        let root = temp_dir("revisions");
        let models = r#""m": {"tokens_per_iter": "1", "name": "org/m", "iters": [1, 2], "revisions": ["r1", null]}"#;
        let cfg = config(&root, models);
        let cat = catalog();
        let slurm = FakeScheduler::default();

        run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        for job in slurm.submitted() {
            match job.iteration {
                1 => assert_eq!(job.env["REVISION"], "r1"),
                _ => assert!(!job.env.contains_key("REVISION")),
            }
        }
    }

    #[tokio::test]
    async fn failed_submission_does_not_stop_the_pass() {
        let root = temp_dir("reject");
        let cfg = config(&root, HUB);
        let cat = catalog();
        let slurm = FakeScheduler {
            reject: Some("eval_m_shard0of2_5".to_string()),
            ..Default::default()
        };

        let report = run_pass(&cfg, &cat, &slurm, &[]).await.unwrap();
        assert_eq!(report.failed, vec!["eval_m_shard0of2_5"]);
        assert_eq!(report.submitted, vec!["eval_m_shard1of2_5"]);
    }

    #[tokio::test]
    async fn forced_tasks_are_resubmitted() {
        let root = temp_dir("forced");
        let run_dir = root.join("m/iter_0000005/harness/eval_0/run");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("results.json"), r#"{"results": {"A": {}, "B": {}, "C": {}}}"#).unwrap();

        let cfg = config(&root, HUB);
        let cat = catalog();
        let slurm = FakeScheduler::default();

        run_pass(&cfg, &cat, &slurm, &["A".to_string()]).await.unwrap();
        assert_eq!(names(&slurm.submitted()), vec!["eval_m_shard0of2_5"]);
    }
}
