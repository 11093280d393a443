//! CLI tests for `contract-runner run` and `contract-runner metrics`.
//!
//! Spawns the binary against a shell-script provider and checks exit codes
//! and the artifacts left in the run directory.

use std::path::Path;
use std::process::Command;

use contract_runner::core::structured::expected_literal_for;
use contract_runner::core::types::ContractMode;
use contract_runner::exit_codes;
use contract_runner::io::config::{ProviderConfig, RunConfig, write_config};
use contract_runner::io::snapshot::load_snapshot;
use contract_runner::io::trial_log::read_trial_log;
use contract_runner::snapshot::RunStatus;

fn write_structured_config(dir: &Path) {
    let reply = expected_literal_for("A");
    let cfg = RunConfig {
        mode: ContractMode::Structured,
        pacing_ms: 0,
        structured_trials: 4,
        provider: ProviderConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat >/dev/null; printf '%s' '{reply}'"),
            ],
            ..ProviderConfig::default()
        },
        ..RunConfig::default()
    };
    write_config(&dir.join("contract-runner.toml"), &cfg).expect("write config");
}

fn runner() -> Command {
    Command::new(env!("CARGO_BIN_EXE_contract-runner"))
}

#[test]
fn structured_run_writes_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_structured_config(temp.path());

    let status = runner()
        .current_dir(temp.path())
        .args(["run", "--run-id", "run-cli"])
        .status()
        .expect("contract-runner run");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let run_dir = temp.path().join("results").join("run-cli");
    let trials = read_trial_log(&run_dir.join("trials.jsonl")).expect("trial log");
    assert_eq!(trials.len(), 4);
    assert_eq!(trials[0].final_exact_match, Some(true));
    assert_eq!(trials[1].final_exact_match, Some(false));

    let snapshot = load_snapshot(&run_dir.join("snapshot.json")).expect("snapshot");
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.run_id, "run-cli");
    assert_eq!(snapshot.counters.pause_count, 3);
    assert!(snapshot.prompts_sha256.is_some());

    let output = runner()
        .current_dir(temp.path())
        .args(["metrics", "results/run-cli/snapshot.json"])
        .output()
        .expect("contract-runner metrics");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let metrics: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(metrics["total_trials"], 4);
    assert_eq!(metrics["initial_failure_count"], 3);
}

#[test]
fn literal_run_without_prompts_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = RunConfig {
        provider: ProviderConfig {
            command: vec!["true".to_string()],
            ..ProviderConfig::default()
        },
        gate: contract_runner::io::config::GateConfig {
            command: vec!["true".to_string()],
            timeout_secs: 5,
        },
        ..RunConfig::default()
    };
    write_config(&temp.path().join("contract-runner.toml"), &cfg).expect("write config");

    let output = runner()
        .current_dir(temp.path())
        .arg("run")
        .output()
        .expect("contract-runner run");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--prompts"));
}

#[test]
fn failing_provider_aborts_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = RunConfig {
        mode: ContractMode::Structured,
        pacing_ms: 0,
        structured_trials: 2,
        provider: ProviderConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo 'invalid api key' >&2; exit 1".to_string(),
            ],
            ..ProviderConfig::default()
        },
        ..RunConfig::default()
    };
    write_config(&temp.path().join("contract-runner.toml"), &cfg).expect("write config");

    let status = runner()
        .current_dir(temp.path())
        .args(["run", "--run-id", "run-abort"])
        .status()
        .expect("contract-runner run");
    assert_eq!(status.code(), Some(exit_codes::ABORTED));

    let snapshot =
        load_snapshot(&temp.path().join("results/run-abort/snapshot.json")).expect("snapshot");
    match snapshot.status {
        RunStatus::Aborted {
            trial_index,
            kind,
            message,
        } => {
            assert_eq!(trial_index, 0);
            assert_eq!(kind, "provider");
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected aborted status, got {other:?}"),
    }
    assert!(snapshot.trials.is_empty());
}
