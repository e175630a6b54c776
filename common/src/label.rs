//! Job names are the only record of what a queued job evaluates:
//! `eval_{model}_{label}_{iteration}`, with label `mixed` or `shard{i}of{n}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EvalError;

pub const JOB_PREFIX: &str = "eval_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobLabel {
    /// Canonical shard `index` out of `count`.
    Shard { index: usize, count: usize },
    /// Ad-hoc group with no canonical boundary.
    Mixed,
}

impl fmt::Display for JobLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobLabel::Shard { index, count } => write!(f, "shard{index}of{count}"),
            JobLabel::Mixed => f.write_str("mixed"),
        }
    }
}

fn parse_digits(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for JobLabel {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "mixed" {
            return Ok(JobLabel::Mixed);
        }

        let parsed = s
            .strip_prefix("shard")
            .and_then(|rest| rest.split_once("of"))
            .and_then(|(i, n)| Some((parse_digits(i)?, parse_digits(n)?)));

        match parsed {
            Some((index, count)) => Ok(JobLabel::Shard { index, count }),
            None => Err(EvalError::MalformedJobName(s.to_string())),
        }
    }
}

/// A parsed `eval_{model}_{label}_{iteration}` job name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobName {
    pub model: String,
    pub label: JobLabel,
    pub iteration: u64,
}

impl JobName {
    pub fn new(model: impl Into<String>, label: JobLabel, iteration: u64) -> Self {
        Self {
            model: model.into(),
            label,
            iteration,
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{JOB_PREFIX}{}_{}_{}", self.model, self.label, self.iteration)
    }
}

impl FromStr for JobName {
    type Err = EvalError;

    /// Splits from the right, so model names may themselves contain `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || EvalError::MalformedJobName(s.to_string());

        let body = s.strip_prefix(JOB_PREFIX).ok_or_else(malformed)?;
        let (rest, iteration) = body.rsplit_once('_').ok_or_else(malformed)?;
        let (model, label) = rest.rsplit_once('_').ok_or_else(malformed)?;

        let iteration = parse_digits(iteration)
            .map(|i| i as u64)
            .ok_or_else(malformed)?;
        let label = label.parse::<JobLabel>().map_err(|_| malformed())?;

        Ok(JobName {
            model: model.to_string(),
            label,
            iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_encode_and_decode() {
        let shard = JobLabel::Shard { index: 3, count: 12 };
        assert_eq!(shard.to_string(), "shard3of12");
        assert_eq!("shard3of12".parse::<JobLabel>().unwrap(), shard);
        assert_eq!("mixed".parse::<JobLabel>().unwrap(), JobLabel::Mixed);
    }

    #[test]
    fn bad_labels_are_rejected() {
        for bad in ["", "shard", "shardof2", "shard1of", "shardXof2", "Mixed", "shard1of2x"] {
            assert!(bad.parse::<JobLabel>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn job_names_round_trip_with_underscored_models() {
        let name = JobName::new("apertus_8b_v2", JobLabel::Shard { index: 0, count: 4 }, 250_000);
        let text = name.to_string();
        assert_eq!(text, "eval_apertus_8b_v2_shard0of4_250000");
        assert_eq!(text.parse::<JobName>().unwrap(), name);

        let mixed: JobName = "eval_llama_mixed_7".parse().unwrap();
        assert_eq!(mixed.model, "llama");
        assert_eq!(mixed.label, JobLabel::Mixed);
        assert_eq!(mixed.iteration, 7);
    }

    /// Jobs that are not evaluations share the queue and must not parse.
    #[test]
    fn unrelated_job_names_are_malformed() {
        for bad in [
            "interactive",
            "eval_model_mixed",
            "eval_model_mixed_x12",
            "eval_model_partial_12",
            "train_model_mixed_12",
            "eval_mixed_12",
        ] {
            assert!(
                matches!(bad.parse::<JobName>(), Err(EvalError::MalformedJobName(_))),
                "{bad} should be malformed"
            );
        }
    }
}
