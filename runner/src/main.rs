//! `contract-runner`: run contract-compliance experiments against a
//! command-backed completion provider.
//!
//! Each run writes `results/<run-id>/trials.jsonl` as trials finalize and
//! keeps `results/<run-id>/snapshot.json` current. Creating
//! `results/<run-id>/STOP` cancels the run at the next trial or retry
//! boundary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use contract_runner::cancel::CancelToken;
use contract_runner::core::metrics::{RunMetrics, compute_metrics, format_confidence_interval};
use contract_runner::core::types::{ContractMode, Prompt};
use contract_runner::exit_codes;
use contract_runner::experiment::{ExperimentRunner, RunStop};
use contract_runner::io::config::{DEFAULT_CONFIG_FILE, RunConfig, load_config, write_config};
use contract_runner::io::gate::{CommandGateObserver, GateObserver, NoGate};
use contract_runner::io::prompts::{
    generate_structured_prompts, load_prompts_jsonl, prompts_sha256, write_prompts_jsonl,
};
use contract_runner::io::proposer::PromptedProposer;
use contract_runner::io::provider::CommandProvider;
use contract_runner::io::snapshot::{SNAPSHOT_FILE, load_snapshot, write_snapshot};
use contract_runner::io::trial_log::{TRIAL_LOG_FILE, TrialLogWriter, read_trial_log};
use contract_runner::logging;
use contract_runner::snapshot::{RunStatus, SnapshotBuilder};

const STOP_FILE: &str = "STOP";

#[derive(Parser)]
#[command(
    name = "contract-runner",
    version,
    about = "Measure exact-output contract compliance over repeated trials"
)]
struct Cli {
    /// Run configuration (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Write procedurally generated structured prompts as JSONL.
    Generate {
        /// Number of prompts (defaults to `structured_trials` from the config).
        #[arg(long)]
        count: Option<usize>,
        #[arg(long, default_value = "structured.jsonl")]
        out: PathBuf,
    },
    /// Run an experiment.
    Run(RunArgs),
    /// Recompute metrics from `trials.jsonl` or `snapshot.json`.
    Metrics {
        path: PathBuf,
        /// Contract mode for a bare trial log (defaults to the config).
        #[arg(long)]
        mode: Option<ContractMode>,
    },
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
struct RunArgs {
    /// Prompt file (JSONL). Structured runs generate prompts when omitted.
    #[arg(long)]
    prompts: Option<PathBuf>,
    #[arg(long)]
    mode: Option<ContractMode>,
    /// Enable bounded corrective retries.
    #[arg(long)]
    assisted: bool,
    #[arg(long)]
    retry_cap: Option<u32>,
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,
    /// Run directory name (defaults to `run-<UTC timestamp>`).
    #[arg(long)]
    run_id: Option<String>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Generate { count, out } => cmd_generate(&cli.config, count, &out),
        Command::Run(args) => cmd_run(&cli.config, &args),
        Command::Metrics { path, mode } => cmd_metrics(&cli.config, &path, mode),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &RunConfig::default())?;
    println!("{}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_generate(config_path: &Path, count: Option<usize>, out: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let prompts = generate_structured_prompts(count.unwrap_or(cfg.structured_trials))?;
    write_prompts_jsonl(out, &prompts)?;
    println!("{} prompts -> {}", prompts.len(), out.display());
    Ok(exit_codes::OK)
}

fn cmd_run(config_path: &Path, args: &RunArgs) -> Result<i32> {
    let mut cfg = load_config(config_path)?;
    apply_overrides(&mut cfg, args);
    cfg.validate_for_run()?;
    let prompts = resolve_prompts(&cfg, args.prompts.as_deref())?;

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%d_%H%M%S")));
    let run_dir = args.out_dir.join(&run_id);
    if run_dir.exists() {
        bail!("run directory {} already exists", run_dir.display());
    }
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;
    eprintln!(
        "run {run_id}: {} prompts; create {} to stop",
        prompts.len(),
        run_dir.join(STOP_FILE).display()
    );

    let ctx = RunContext {
        cfg: &cfg,
        run_id: &run_id,
        run_dir: &run_dir,
        prompts: &prompts,
        prompts_digest: prompts_sha256(&prompts)?,
    };
    match cfg.mode {
        ContractMode::Literal => execute(&ctx, CommandGateObserver::new(&cfg.gate)?),
        ContractMode::Structured => execute(&ctx, NoGate),
    }
}

fn apply_overrides(cfg: &mut RunConfig, args: &RunArgs) {
    if let Some(mode) = args.mode {
        cfg.mode = mode;
    }
    if args.assisted {
        cfg.assisted = true;
    }
    if let Some(cap) = args.retry_cap {
        cfg.retry_cap = cap;
    }
}

fn resolve_prompts(cfg: &RunConfig, path: Option<&Path>) -> Result<Vec<Prompt>> {
    let prompts = match (path, cfg.mode) {
        (Some(path), _) => load_prompts_jsonl(path)?,
        (None, ContractMode::Structured) => generate_structured_prompts(cfg.structured_trials)?,
        (None, ContractMode::Literal) => bail!("literal runs need --prompts"),
    };
    if prompts.is_empty() {
        bail!("no prompts to run");
    }
    Ok(prompts)
}

struct RunContext<'a> {
    cfg: &'a RunConfig,
    run_id: &'a str,
    run_dir: &'a Path,
    prompts: &'a [Prompt],
    prompts_digest: String,
}

fn execute<G: GateObserver>(ctx: &RunContext<'_>, gate: G) -> Result<i32> {
    let cfg = ctx.cfg;
    let provider = CommandProvider::new(&cfg.provider);
    let proposer =
        PromptedProposer::new(&provider, &cfg.model, cfg.max_tokens, cfg.proposal_max_chars)?;
    let cancel = CancelToken::new().with_stop_file(ctx.run_dir.join(STOP_FILE));
    let builder = SnapshotBuilder::new(ctx.run_id, cfg).prompts_sha256(ctx.prompts_digest.clone());
    let snapshot_path = ctx.run_dir.join(SNAPSHOT_FILE);
    let mut log = TrialLogWriter::create(&ctx.run_dir.join(TRIAL_LOG_FILE))?;

    let mut runner = ExperimentRunner::new(cfg, &provider, gate, &proposer).with_cancel(cancel);
    let mut published = Vec::new();
    let outcome = runner.run(ctx.prompts, |trial, counters| {
        log.append(trial)?;
        published.push(trial.clone());
        write_snapshot(
            &snapshot_path,
            &builder.build(RunStatus::Running, &published, *counters),
        )?;
        eprintln!(
            "[{}/{}] {} exact={} gate={:?} retries={}",
            trial.index + 1,
            ctx.prompts.len(),
            trial.prompt_id,
            trial
                .final_exact_match
                .map_or("n/a".to_string(), |exact| exact.to_string()),
            trial.final_gate,
            trial.retry_count_used
        );
        Ok(())
    });

    let snapshot = builder.build(
        RunStatus::from(&outcome.stop),
        runner.trials(),
        runner.counters(),
    );
    write_snapshot(&snapshot_path, &snapshot)?;
    info!(
        run_id = ctx.run_id,
        status = outcome.stop.label(),
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "run finished"
    );

    print_summary(&snapshot.metrics);
    println!("snapshot: {}", snapshot_path.display());
    let code = match &outcome.stop {
        RunStop::Completed => exit_codes::OK,
        RunStop::Cancelled { next_index } => {
            eprintln!("cancelled before prompt {}", next_index + 1);
            exit_codes::CANCELLED
        }
        RunStop::Aborted { trial_index, error } => {
            eprintln!("aborted at trial {trial_index}: {error}");
            exit_codes::ABORTED
        }
    };
    Ok(code)
}

fn cmd_metrics(config_path: &Path, path: &Path, mode: Option<ContractMode>) -> Result<i32> {
    let metrics = if path.extension().is_some_and(|ext| ext == "jsonl") {
        let mode = match mode {
            Some(mode) => mode,
            None => load_config(config_path)?.mode,
        };
        compute_metrics(&read_trial_log(path)?, mode)
    } else {
        let snapshot = load_snapshot(path)?;
        compute_metrics(&snapshot.trials, mode.unwrap_or(snapshot.config.mode))
    };
    let json = serde_json::to_string_pretty(&metrics).context("serialize metrics")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn print_summary(metrics: &RunMetrics) {
    let fmt_rate = |rate: Option<f64>| rate.map_or("N/A".to_string(), |r| format!("{r:.3}"));
    println!(
        "trials: {} (contract: {}, contract errors: {})",
        metrics.total_trials, metrics.contract_trials, metrics.contract_errors
    );
    println!(
        "initial failure: {} {}",
        fmt_rate(metrics.initial_failure.rate),
        format_confidence_interval(metrics.initial_failure.rate, metrics.contract_trials)
    );
    println!(
        "correction success: {} ({} of {})",
        fmt_rate(metrics.correction_success_rate),
        metrics.correction_success_count,
        metrics.initial_failure_count
    );
    println!(
        "final residual failure: {} {}",
        fmt_rate(metrics.final_residual_failure.rate),
        format_confidence_interval(metrics.final_residual_failure.rate, metrics.contract_trials)
    );
    println!(
        "pause: initial {} final {} (yield {})",
        metrics.initial_pause_count, metrics.final_pause_count, metrics.final_yield_count
    );
}
