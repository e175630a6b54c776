use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use common::config::SbatchConfig;
use common::{JobSubmission, RunningJobs};

/// The batch system evaluations are queued on.
pub trait BatchScheduler {
    /// Evaluation jobs of the current user that are still queued or running.
    fn active_jobs(&self) -> impl Future<Output = Result<RunningJobs>> + Send;

    /// Queues one job. Only success or failure is reported back.
    fn submit(&self, job: &JobSubmission) -> impl Future<Output = Result<()>> + Send;
}

/// `squeue` / `sbatch` on the local login node.
#[derive(Debug, Clone)]
pub struct Slurm {
    script: PathBuf,
    environment: String,
    /// Set when the official inference image was requested. Hub checkpoints
    /// run there, with the harness fork exported to the job.
    official: Option<(String, BTreeMap<String, String>)>,
    dry_run: bool,
}

impl Slurm {
    pub fn new(sbatch: &SbatchConfig, use_official_vllm: bool, dry_run: bool) -> Self {
        let official = use_official_vllm.then(|| {
            let env = BTreeMap::from([
                ("HARNESS_FORK".to_string(), sbatch.harness_fork.clone()),
                ("HARNESS_BRANCH".to_string(), sbatch.harness_branch.clone()),
            ]);
            (sbatch.official_environment.clone(), env)
        });

        Self {
            script: sbatch.script.clone(),
            environment: sbatch.environment.clone(),
            official,
            dry_run,
        }
    }

    /// Container environment and extra variables for `job`.
    fn launch_env(&self, job: &JobSubmission) -> (&str, Option<&BTreeMap<String, String>>) {
        match &self.official {
            Some((environment, env)) if job.hub_checkpoint => (environment.as_str(), Some(env)),
            _ => (self.environment.as_str(), None),
        }
    }

    fn sbatch_args(&self, job: &JobSubmission) -> Vec<String> {
        let (environment, _) = self.launch_env(job);
        let mut args = vec![
            format!("--environment={environment}"),
            format!("--job-name={}", job.name),
            self.script.display().to_string(),
        ];
        args.extend(job.script_args());
        args
    }
}

impl BatchScheduler for Slurm {
    async fn active_jobs(&self) -> Result<RunningJobs> {
        let out = Command::new("squeue")
            .args(["--me", "--format=\"%j\"", "--noheader"])
            .output()
            .await
            .context("running squeue")?;

        if !out.status.success() {
            bail!(
                "squeue exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }

        let running = RunningJobs::from_listing(&String::from_utf8_lossy(&out.stdout));
        debug!("{} evaluation jobs in the queue", running.len());
        Ok(running)
    }

    async fn submit(&self, job: &JobSubmission) -> Result<()> {
        let args = self.sbatch_args(job);

        if self.dry_run {
            info!("[dry-run] sbatch {} (TASKS={})", args.join(" "), job.tasks.join(","));
            return Ok(());
        }

        let (_, official_env) = self.launch_env(job);
        let out = Command::new("sbatch")
            .args(&args)
            .envs(&job.env)
            .envs(official_env.into_iter().flatten())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("running sbatch for {}", job.name))?;

        if !out.status.success() {
            bail!(
                "sbatch for {} exited with {}: {}",
                job.name,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        debug!("{}", String::from_utf8_lossy(&out.stdout).trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::partition;
    use common::{dispatch, Catalog, SubmissionTarget, Task, TaskKind};
    use std::collections::BTreeSet;

    fn submission() -> JobSubmission {
        let cat = Catalog::from_tasks(vec![Task {
            name: "hellaswag".to_string(),
            weight: 10,
            kinds: BTreeSet::from([TaskKind::Pretrain]),
            language: None,
            dimension: common::Dimension::GeneralAbilities,
            aliases: Vec::new(),
        }])
        .unwrap();
        let canon = partition(&cat.refs(), 1).unwrap();
        let target = SubmissionTarget {
            model: "m".to_string(),
            checkpoint: "/ckpt/m".to_string(),
            iteration: 7,
            tokens_per_iter: "42".to_string(),
            model_size: 1.0,
            logs_root: PathBuf::from("/logs"),
            extra_env: BTreeMap::new(),
        };
        dispatch(&target, &cat.refs(), &canon, 100).unwrap().remove(0)
    }

    #[test]
    fn sbatch_command_line() {
        let slurm = Slurm::new(&SbatchConfig::default(), false, true);
        assert_eq!(
            slurm.sbatch_args(&submission()),
            vec![
                "--environment=./containers/env.toml",
                "--job-name=eval_m_shard0of1_7",
                "scripts/evaluate.sbatch",
                "/ckpt/m",
                "7",
                "42",
                "m",
            ]
        );
        assert!(slurm.launch_env(&submission()).1.is_none());
    }

    #[test]
    fn official_image_is_for_hub_checkpoints_only() {
        let slurm = Slurm::new(&SbatchConfig::default(), true, true);

        let megatron = submission();
        assert_eq!(slurm.launch_env(&megatron).0, "./containers/env.toml");
        assert!(slurm.launch_env(&megatron).1.is_none());

        let mut hub = submission();
        hub.hub_checkpoint = true;
        let (environment, env) = slurm.launch_env(&hub);
        assert_eq!(environment, "./containers/env-official.toml");
        assert_eq!(env.unwrap()["HARNESS_BRANCH"], "main");
        assert_eq!(slurm.sbatch_args(&hub)[0], "--environment=./containers/env-official.toml");
    }

    #[tokio::test]
    async fn dry_run_does_not_call_sbatch() {
        let slurm = Slurm::new(&SbatchConfig::default(), false, true);
        slurm.submit(&submission()).await.unwrap();
    }
}
