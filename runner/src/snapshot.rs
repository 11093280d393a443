//! Run snapshot: configuration, trial log and derived metrics in one document.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::invariants::validate_trial_log;
use crate::core::metrics::{RunMetrics, compute_metrics};
use crate::core::types::Trial;
use crate::experiment::{RunCounters, RunStop};
use crate::io::config::RunConfig;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// How the run ended (or `running` for an in-progress snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled {
        next_index: usize,
    },
    Aborted {
        trial_index: usize,
        kind: String,
        message: String,
    },
}

impl From<&RunStop> for RunStatus {
    fn from(stop: &RunStop) -> Self {
        match stop {
            RunStop::Completed => RunStatus::Completed,
            RunStop::Cancelled { next_index } => RunStatus::Cancelled {
                next_index: *next_index,
            },
            RunStop::Aborted { trial_index, error } => RunStatus::Aborted {
                trial_index: *trial_index,
                kind: error.kind().to_string(),
                message: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub run_id: String,
    /// RFC 3339, UTC.
    pub generated_at: String,
    /// Digest of the prompt set the run was fed.
    pub prompts_sha256: Option<String>,
    pub config: RunConfig,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub trials: Vec<Trial>,
    pub metrics: RunMetrics,
    /// Trial-log invariant violations; empty for a healthy run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invariant_violations: Vec<String>,
}

/// Assembles [`Snapshot`]s for one run.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder<'a> {
    run_id: &'a str,
    config: &'a RunConfig,
    prompts_sha256: Option<String>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(run_id: &'a str, config: &'a RunConfig) -> Self {
        Self {
            run_id,
            config,
            prompts_sha256: None,
        }
    }

    pub fn prompts_sha256(mut self, digest: impl Into<String>) -> Self {
        self.prompts_sha256 = Some(digest.into());
        self
    }

    pub fn build(&self, status: RunStatus, trials: &[Trial], counters: RunCounters) -> Snapshot {
        self.build_at(Utc::now(), status, trials, counters)
    }

    /// Metrics and invariant checks are recomputed from `trials`.
    pub fn build_at(
        &self,
        generated_at: DateTime<Utc>,
        status: RunStatus,
        trials: &[Trial],
        counters: RunCounters,
    ) -> Snapshot {
        Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            run_id: self.run_id.to_string(),
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            prompts_sha256: self.prompts_sha256.clone(),
            config: self.config.clone(),
            status,
            counters,
            trials: trials.to_vec(),
            metrics: compute_metrics(trials, self.config.mode),
            invariant_violations: validate_trial_log(trials, self.config.mode, self.config.retry_cap),
        }
    }
}
