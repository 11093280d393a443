//! Snapshot persistence (`snapshot.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::snapshot::Snapshot;

pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Atomically write a snapshot (temp file + rename).
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    debug!(path = %path.display(), trials = snapshot.trials.len(), "writing snapshot");
    let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse snapshot {}", path.display()))
}
