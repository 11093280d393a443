//! Append-only `trials.jsonl` artifact.
//!
//! One finalized trial per line, written as soon as the runner emits it, so a
//! crashed or cancelled run still leaves every completed trial on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::Trial;

pub const TRIAL_LOG_FILE: &str = "trials.jsonl";

pub struct TrialLogWriter {
    path: PathBuf,
    file: File,
}

impl TrialLogWriter {
    /// Create (or truncate) the log at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open trial log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn append(&mut self, trial: &Trial) -> Result<()> {
        let mut line = serde_json::to_string(trial).context("serialize trial")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append trial log {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush trial log {}", self.path.display()))?;
        debug!(index = trial.index, "trial appended");
        Ok(())
    }
}

/// Read a trial log back, skipping blank lines.
pub fn read_trial_log(path: &Path) -> Result<Vec<Trial>> {
    let file = File::open(path).with_context(|| format!("open trial log {}", path.display()))?;
    let mut trials = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read trial log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let trial: Trial = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        trials.push(trial);
    }
    Ok(trials)
}
