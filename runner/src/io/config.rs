//! Run configuration stored as TOML (default `contract-runner.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::ContractMode;

pub const DEFAULT_CONFIG_FILE: &str = "contract-runner.toml";

/// Experiment configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that
/// run a passive literal experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Contract shape the run evaluates against.
    pub mode: ContractMode,

    /// Allow bounded corrective retries after a failed initial output.
    pub assisted: bool,

    /// Maximum retries per trial in assisted mode.
    pub retry_cap: u32,

    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,

    /// Delay between trials, in milliseconds.
    pub pacing_ms: u64,

    /// Upper bound on correction proposal length, in characters.
    pub proposal_max_chars: usize,

    /// Number of prompts to generate for structured runs without a prompt file.
    pub structured_trials: usize,

    pub provider: ProviderConfig,
    pub gate: GateConfig,
}

/// Command-backed completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Command receiving the completion request as JSON on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate provider stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Command-backed gate observer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Command invoked with `observe`, `decide` or `constraint` appended.
    /// Required for literal runs.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: ContractMode::Literal,
            assisted: false,
            retry_cap: 2,
            model: "default".to_string(),
            temperature: 0.0,
            max_tokens: 256,
            system_prompt: None,
            pacing_ms: 1_000,
            proposal_max_chars: 400,
            structured_trials: 20,
            provider: ProviderConfig::default(),
            gate: GateConfig {
                command: Vec::new(),
                timeout_secs: 30,
            },
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(anyhow!("temperature must be within [0, 2]"));
        }
        if self.max_tokens == 0 {
            return Err(anyhow!("max_tokens must be > 0"));
        }
        if self.assisted && self.retry_cap == 0 {
            return Err(anyhow!("retry_cap must be > 0 when assisted is enabled"));
        }
        if self.proposal_max_chars == 0 {
            return Err(anyhow!("proposal_max_chars must be > 0"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        if self.gate.timeout_secs == 0 {
            return Err(anyhow!("gate.timeout_secs must be > 0"));
        }
        if !self.gate.command.is_empty() && self.gate.command[0].trim().is_empty() {
            return Err(anyhow!("gate.command must not start with an empty program"));
        }
        Ok(())
    }

    /// Checks that only matter when actually executing a run.
    pub fn validate_for_run(&self) -> Result<()> {
        self.validate()?;
        if self.provider.command.is_empty() || self.provider.command[0].trim().is_empty() {
            return Err(anyhow!("provider.command must be a non-empty array"));
        }
        if self.mode == ContractMode::Literal && self.gate.command.is_empty() {
            return Err(anyhow!("gate.command is required for literal runs"));
        }
        Ok(())
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
