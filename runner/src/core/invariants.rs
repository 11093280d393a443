//! Trial-log invariants that the type system cannot express.

use std::collections::HashSet;

use crate::core::types::{ContractMode, Taxonomy, Trial};

/// Check a finalized trial log:
/// - indexes are `0..n` in order
/// - `retry_count_used <= retry_cap`
/// - `correction_succeeded` implies retries were spent and the final output is exact
/// - structured trials with a contract carry exactly one taxonomy whose
///   exactness agrees with `final_exact_match`
pub fn validate_trial_log(trials: &[Trial], mode: ContractMode, retry_cap: u32) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (position, trial) in trials.iter().enumerate() {
        let label = format!("trial[{}] ({})", position, trial.prompt_id);
        if trial.index != position {
            errors.push(format!("{label}: index {} out of order", trial.index));
        }
        if !seen.insert(trial.index) {
            errors.push(format!("{label}: duplicate index {}", trial.index));
        }
        if trial.retry_count_used > retry_cap {
            errors.push(format!(
                "{label}: retry_count_used {} exceeds retry_cap {}",
                trial.retry_count_used, retry_cap
            ));
        }
        if trial.correction_succeeded
            && (trial.retry_count_used == 0 || trial.final_exact_match != Some(true))
        {
            errors.push(format!(
                "{label}: correction_succeeded requires retries and a final exact match"
            ));
        }
        if trial.has_contract() != trial.final_exact_match.is_some() {
            errors.push(format!("{label}: initial and final exactness disagree on contract"));
        }
        if mode == ContractMode::Structured && trial.has_contract() {
            match trial.taxonomy {
                None => errors.push(format!("{label}: structured trial missing taxonomy")),
                Some(taxonomy) => {
                    let exact = taxonomy == Taxonomy::ExactMatch;
                    if trial.final_exact_match != Some(exact) {
                        errors.push(format!(
                            "{label}: taxonomy {} disagrees with final_exact_match",
                            taxonomy.as_str()
                        ));
                    }
                }
            }
        }
    }

    errors
}
