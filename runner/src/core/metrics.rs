//! Run-wide metrics derived from the trial log.
//!
//! Every figure here is recomputed from the trials it is given; nothing is
//! accumulated between calls. A rate of `None` means the denominator was
//! zero, which is distinct from a measured rate of `0.0`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::classifier::classify;
use crate::core::types::{ContractMode, GateState, MismatchKind, Taxonomy, Trial};

/// Optional rate: `None` when nothing was measured.
pub type Rate = Option<f64>;

/// z-score for a two-sided 95% interval.
const Z_95: f64 = 1.96;

/// `numerator / denominator`, or `None` for an empty denominator.
pub fn rate(numerator: usize, denominator: usize) -> Rate {
    if denominator == 0 {
        return None;
    }
    Some(numerator as f64 / denominator as f64)
}

/// Closed interval on `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub low: f64,
    pub high: f64,
}

/// Normal-approximation 95% confidence interval for a proportion.
pub fn confidence_interval_95(p: Rate, n: usize) -> Option<Interval> {
    let p = p?;
    if n == 0 || !p.is_finite() {
        return None;
    }
    let margin = Z_95 * (p * (1.0 - p) / n as f64).sqrt();
    Some(Interval {
        low: (p - margin).clamp(0.0, 1.0),
        high: (p + margin).clamp(0.0, 1.0),
    })
}

/// Render the interval for reports: `"N/A"` when undefined.
pub fn format_confidence_interval(p: Rate, n: usize) -> String {
    match confidence_interval_95(p, n) {
        Some(interval) => format!("[{:.3}, {:.3}]", interval.low, interval.high),
        None => "N/A".to_string(),
    }
}

/// Rate with its 95% interval over `denominator` samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateWithInterval {
    pub rate: Rate,
    pub ci95: Option<Interval>,
}

impl RateWithInterval {
    fn new(numerator: usize, denominator: usize) -> Self {
        let value = rate(numerator, denominator);
        Self {
            rate: value,
            ci95: confidence_interval_95(value, denominator),
        }
    }
}

/// Literal-contract breakdown of initial outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralMetrics {
    pub baseline_exact_count: usize,
    pub baseline_formatting_only_count: usize,
    pub baseline_hard_semantic_failure_count: usize,
    pub baseline_formatting_only_rate: Rate,
    pub baseline_hard_semantic_failure_rate: Rate,
}

/// Count and rate for one taxonomy value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyTally {
    pub count: usize,
    pub rate: Rate,
}

/// Structured-contract taxonomy tallies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredMetrics {
    /// Trials that carried a taxonomy. Tally rates divide by all trials, so
    /// uncontracted trials count against every taxonomy.
    pub classified_trials: usize,
    pub initial: BTreeMap<Taxonomy, TaxonomyTally>,
    #[serde(rename = "final")]
    pub final_: BTreeMap<Taxonomy, TaxonomyTally>,
}

/// Run-wide metrics. Derived, never stored independently of the trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub mode: ContractMode,
    pub total_trials: usize,
    /// Trials with a defined contract.
    pub contract_trials: usize,
    pub contract_errors: usize,
    pub initial_failure_count: usize,
    pub initial_failure: RateWithInterval,
    pub correction_success_count: usize,
    pub correction_success_rate: Rate,
    pub final_residual_failure_count: usize,
    pub final_residual_failure: RateWithInterval,
    pub initial_pause_count: usize,
    pub final_pause_count: usize,
    pub final_yield_count: usize,
    pub initial_pause_rate: Rate,
    pub final_pause_rate: Rate,
    pub constraint_applied_count: usize,
    pub total_retries: u64,
    /// Mean retries spent per initially-failing trial.
    pub mean_retries_per_failure: Rate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literal: Option<LiteralMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredMetrics>,
}

/// Compute metrics for `trials` under `mode`.
pub fn compute_metrics(trials: &[Trial], mode: ContractMode) -> RunMetrics {
    let total_trials = trials.len();
    let contract: Vec<&Trial> = trials.iter().filter(|trial| trial.has_contract()).collect();
    let contract_trials = contract.len();
    let contract_errors = trials
        .iter()
        .filter(|trial| trial.contract_error.is_some())
        .count();

    let initial_failures: Vec<&Trial> = contract
        .iter()
        .copied()
        .filter(|trial| trial.initially_failed())
        .collect();
    let initial_failure_count = initial_failures.len();
    let correction_success_count = initial_failures
        .iter()
        .filter(|trial| trial.correction_succeeded)
        .count();
    let final_residual_failure_count = contract
        .iter()
        .filter(|trial| trial.final_exact_match != Some(true))
        .count();

    let initial_pause_count = count_gate(trials, |trial| trial.initial_gate, GateState::Pause);
    let final_pause_count = count_gate(trials, |trial| trial.final_gate, GateState::Pause);
    let final_yield_count = count_gate(trials, |trial| trial.final_gate, GateState::Yield);

    let total_retries: u64 = trials
        .iter()
        .map(|trial| u64::from(trial.retry_count_used))
        .sum();
    let failure_retries: u64 = initial_failures
        .iter()
        .map(|trial| u64::from(trial.retry_count_used))
        .sum();
    let mean_retries_per_failure = if initial_failure_count == 0 {
        None
    } else {
        Some(failure_retries as f64 / initial_failure_count as f64)
    };

    let (literal, structured) = match mode {
        ContractMode::Literal => (Some(literal_metrics(&contract)), None),
        ContractMode::Structured => (None, Some(structured_metrics(trials))),
    };

    RunMetrics {
        mode,
        total_trials,
        contract_trials,
        contract_errors,
        initial_failure_count,
        initial_failure: RateWithInterval::new(initial_failure_count, contract_trials),
        correction_success_count,
        correction_success_rate: rate(correction_success_count, initial_failure_count),
        final_residual_failure_count,
        final_residual_failure: RateWithInterval::new(
            final_residual_failure_count,
            contract_trials,
        ),
        initial_pause_count,
        final_pause_count,
        final_yield_count,
        initial_pause_rate: rate(initial_pause_count, total_trials),
        final_pause_rate: rate(final_pause_count, total_trials),
        constraint_applied_count: trials
            .iter()
            .filter(|trial| trial.constraint_applied)
            .count(),
        total_retries,
        mean_retries_per_failure,
        literal,
        structured,
    }
}

fn count_gate<F: Fn(&Trial) -> GateState>(trials: &[Trial], gate: F, state: GateState) -> usize {
    trials.iter().filter(|trial| gate(trial) == state).count()
}

/// Re-classify each contract trial's initial output.
fn literal_metrics(contract: &[&Trial]) -> LiteralMetrics {
    let mut exact = 0;
    let mut formatting_only = 0;
    let mut semantic = 0;
    for trial in contract {
        let Some(expected) = trial.expected_literal.as_deref() else {
            continue;
        };
        let exact_match = trial.initial_exact_match == Some(true);
        match classify(expected, &trial.initial_output, exact_match) {
            MismatchKind::Exact => exact += 1,
            MismatchKind::FormattingOnly => formatting_only += 1,
            MismatchKind::SemanticHardFailure => semantic += 1,
        }
    }
    LiteralMetrics {
        baseline_exact_count: exact,
        baseline_formatting_only_count: formatting_only,
        baseline_hard_semantic_failure_count: semantic,
        baseline_formatting_only_rate: rate(formatting_only, contract.len()),
        baseline_hard_semantic_failure_rate: rate(semantic, contract.len()),
    }
}

fn structured_metrics(trials: &[Trial]) -> StructuredMetrics {
    let classified_trials = trials
        .iter()
        .filter(|trial| trial.taxonomy.is_some())
        .count();
    StructuredMetrics {
        classified_trials,
        initial: tally(trials, |trial| trial.initial_taxonomy),
        final_: tally(trials, |trial| trial.taxonomy),
    }
}

fn tally<F: Fn(&Trial) -> Option<Taxonomy>>(
    trials: &[Trial],
    taxonomy: F,
) -> BTreeMap<Taxonomy, TaxonomyTally> {
    Taxonomy::ALL
        .iter()
        .map(|&kind| {
            let count = trials
                .iter()
                .filter(|trial| taxonomy(trial) == Some(kind))
                .count();
            (
                kind,
                TaxonomyTally {
                    count,
                    rate: rate(count, trials.len()),
                },
            )
        })
        .collect()
}
