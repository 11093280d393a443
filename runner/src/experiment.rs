//! Experiment runner: drives prompts through completion, classification,
//! gating and bounded assisted retries, one trial at a time.
//!
//! Per trial: `PENDING -> INITIAL_EVALUATED -> [RETRY_i]* -> FINALIZED`.
//! Finalized trials are appended to an in-memory log owned by the runner and
//! published to the caller before the next trial starts.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::is_exact;
use crate::core::metrics::{RunMetrics, compute_metrics};
use crate::core::structured::classify_structured;
use crate::core::types::{
    ContractMode, GateState, Prompt, StructuredDiagnostics, Taxonomy, Trial,
};
use crate::error::{ContractError, RunError};
use crate::io::config::RunConfig;
use crate::io::gate::GateObserver;
use crate::io::proposer::{ConstraintProposer, TrialContext};
use crate::io::provider::{CompletionProvider, CompletionRequest};

/// Longest single sleep while pacing, so cancellation stays responsive.
const PACING_SLICE: Duration = Duration::from_millis(100);

/// Run-wide counters, updated as one unit after each finalized trial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub trials_emitted: usize,
    pub initial_pause_count: usize,
    /// Trials whose final gate state is PAUSE.
    pub pause_count: usize,
    pub yield_count: usize,
}

impl RunCounters {
    fn record(&mut self, trial: &Trial) {
        self.trials_emitted += 1;
        if trial.initial_gate == GateState::Pause {
            self.initial_pause_count += 1;
        }
        match trial.final_gate {
            GateState::Pause => self.pause_count += 1,
            GateState::Yield => self.yield_count += 1,
            GateState::Continue => {}
        }
    }
}

/// Why [`ExperimentRunner::run`] stopped.
#[derive(Debug)]
pub enum RunStop {
    /// Every prompt produced a finalized trial.
    Completed,
    /// Cancellation was observed; `next_index` is the first prompt not run.
    Cancelled { next_index: usize },
    /// A collaborator failed while building trial `trial_index`.
    Aborted { trial_index: usize, error: RunError },
}

impl RunStop {
    pub fn label(&self) -> &'static str {
        match self {
            RunStop::Completed => "completed",
            RunStop::Cancelled { .. } => "cancelled",
            RunStop::Aborted { .. } => "aborted",
        }
    }
}

/// Summary of a run invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub trials_emitted: usize,
    pub elapsed: Duration,
    pub stop: RunStop,
}

/// Contract a prompt carries under the run's mode.
enum Contract<'p> {
    Literal(&'p str),
    Structured { label: &'p str, literal: &'p str },
    Missing(ContractError),
}

impl<'p> Contract<'p> {
    fn for_prompt(mode: ContractMode, prompt: &'p Prompt) -> Self {
        let literal = prompt
            .expected_literal
            .as_deref()
            .filter(|literal| !literal.trim().is_empty());
        let missing = |reason: &str| {
            Contract::Missing(ContractError {
                prompt_id: prompt.id.clone(),
                reason: reason.to_string(),
            })
        };
        match (mode, literal) {
            (_, None) => missing("missing or blank expected literal"),
            (ContractMode::Literal, Some(literal)) => Contract::Literal(literal),
            (ContractMode::Structured, Some(literal)) => {
                match prompt
                    .expected_label
                    .as_deref()
                    .filter(|label| !label.trim().is_empty())
                {
                    Some(label) => Contract::Structured { label, literal },
                    None => missing("missing expected label"),
                }
            }
        }
    }

    fn expected_literal(&self) -> Option<&'p str> {
        match self {
            Contract::Literal(literal) => Some(literal),
            Contract::Structured { literal, .. } => Some(literal),
            Contract::Missing(_) => None,
        }
    }
}

/// Result of evaluating one output (initial or retry).
#[derive(Debug, Clone, Default)]
struct Evaluation {
    exact: Option<bool>,
    taxonomy: Option<Taxonomy>,
    diagnostics: Option<StructuredDiagnostics>,
    gate: Option<GateState>,
    telemetry: Option<Value>,
    reason_codes: Vec<String>,
}

impl Evaluation {
    fn gate(&self) -> GateState {
        self.gate.unwrap_or(GateState::Pause)
    }

    fn is_exact(&self) -> bool {
        self.exact == Some(true)
    }
}

/// Mutable state of the trial being built, threaded through the retry loop.
#[derive(Debug)]
struct TrialInProgress {
    output: String,
    latest: Evaluation,
    retry_count_used: u32,
    constraint_applied: bool,
}

impl TrialInProgress {
    fn can_retry(&self, retry_cap: u32) -> bool {
        self.retry_count_used < retry_cap && !self.latest.is_exact()
    }
}

/// Orchestrates trials over injected collaborators.
///
/// Generic over the provider, gate and proposer so tests can drive it with
/// scripted doubles and the CLI with command-backed adapters.
pub struct ExperimentRunner<'a, P, G, C> {
    config: &'a RunConfig,
    provider: P,
    gate: G,
    proposer: C,
    cancel: CancelToken,
    trials: Vec<Trial>,
    counters: RunCounters,
    active_constraint: Option<String>,
}

impl<'a, P, G, C> ExperimentRunner<'a, P, G, C>
where
    P: CompletionProvider,
    G: GateObserver,
    C: ConstraintProposer,
{
    pub fn new(config: &'a RunConfig, provider: P, gate: G, proposer: C) -> Self {
        Self {
            config,
            provider,
            gate,
            proposer,
            cancel: CancelToken::new(),
            trials: Vec::new(),
            counters: RunCounters::default(),
            active_constraint: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Finalized trials, in emission order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    /// Constraint submitted to the gate most recently, if any.
    pub fn active_constraint(&self) -> Option<&str> {
        self.active_constraint.as_deref()
    }

    /// Metrics recomputed from the trial log.
    pub fn metrics(&self) -> RunMetrics {
        compute_metrics(&self.trials, self.config.mode)
    }

    /// Run every prompt in order.
    ///
    /// `on_trial` sees each finalized trial together with the updated
    /// counters; an error from it aborts the run like a collaborator failure.
    #[instrument(skip_all, fields(mode = %self.config.mode, assisted = self.config.assisted, prompts = prompts.len()))]
    pub fn run<F>(&mut self, prompts: &[Prompt], mut on_trial: F) -> RunOutcome
    where
        F: FnMut(&Trial, &RunCounters) -> anyhow::Result<()>,
    {
        let started = Instant::now();
        let first_index = self.trials.len();
        let stop = self.run_prompts(prompts, &mut on_trial);
        match &stop {
            RunStop::Completed => info!(trials = self.trials.len(), "run completed"),
            RunStop::Cancelled { next_index } => {
                info!(next_index, "run cancelled");
            }
            RunStop::Aborted { trial_index, error } => {
                warn!(trial_index, kind = error.kind(), err = %error, "run aborted");
            }
        }
        RunOutcome {
            trials_emitted: self.trials.len() - first_index,
            elapsed: started.elapsed(),
            stop,
        }
    }

    fn run_prompts<F>(&mut self, prompts: &[Prompt], on_trial: &mut F) -> RunStop
    where
        F: FnMut(&Trial, &RunCounters) -> anyhow::Result<()>,
    {
        for (position, prompt) in prompts.iter().enumerate() {
            let index = self.trials.len();
            if self.cancel.is_cancelled() {
                return RunStop::Cancelled { next_index: index };
            }

            let trial = match self.run_trial(index, prompt) {
                Ok(trial) => trial,
                Err(error) => {
                    return RunStop::Aborted {
                        trial_index: index,
                        error,
                    };
                }
            };

            self.counters.record(&trial);
            self.trials.push(trial);
            let (trial, counters) = (&self.trials[index], self.counters);
            if let Err(err) = on_trial(trial, &counters) {
                return RunStop::Aborted {
                    trial_index: index,
                    error: RunError::Publish(err),
                };
            }

            if position + 1 < prompts.len() {
                self.pace();
            }
        }
        RunStop::Completed
    }

    #[instrument(skip_all, fields(index = index, prompt_id = %prompt.id))]
    fn run_trial(&mut self, index: usize, prompt: &Prompt) -> Result<Trial, RunError> {
        let contract = Contract::for_prompt(self.config.mode, prompt);
        if let Contract::Missing(err) = &contract {
            warn!(err = %err, "trial has no usable contract");
        }

        let initial_output = self.complete(prompt)?;
        let initial = self.evaluate(&trial_id(index, 0), &contract, &initial_output)?;
        debug!(exact = ?initial.exact, gate = ?initial.gate(), "initial output evaluated");

        let mut progress = TrialInProgress {
            output: initial_output.clone(),
            latest: initial.clone(),
            retry_count_used: 0,
            constraint_applied: false,
        };
        if self.config.assisted && initial.exact == Some(false) {
            while progress.can_retry(self.config.retry_cap) {
                if self.cancel.is_cancelled() {
                    info!(
                        retry_count_used = progress.retry_count_used,
                        "cancelled during retries, finalizing trial"
                    );
                    break;
                }
                self.retry_step(index, prompt, &contract, &mut progress)?;
            }
        }

        let TrialInProgress {
            output,
            latest,
            retry_count_used,
            constraint_applied,
        } = progress;
        let final_exact_match = latest.exact;
        let trial = Trial {
            index,
            prompt_id: prompt.id.clone(),
            prompt: prompt.text.clone(),
            category: prompt.category.clone(),
            expected_literal: prompt.expected_literal.clone(),
            expected_label: prompt.expected_label.clone(),
            initial_output,
            final_output: output,
            initial_gate: initial.gate(),
            final_gate: latest.gate(),
            telemetry: latest.telemetry,
            reason_codes: latest.reason_codes,
            initial_exact_match: initial.exact,
            final_exact_match,
            retry_count_used,
            correction_succeeded: final_exact_match == Some(true) && retry_count_used > 0,
            constraint_applied,
            initial_taxonomy: initial.taxonomy,
            taxonomy: latest.taxonomy,
            diagnostics: latest.diagnostics,
            contract_error: match contract {
                Contract::Missing(err) => Some(err.to_string()),
                _ => None,
            },
        };
        info!(
            exact = ?trial.final_exact_match,
            gate = ?trial.final_gate,
            retries = trial.retry_count_used,
            corrected = trial.correction_succeeded,
            "trial finalized"
        );
        Ok(trial)
    }

    /// One assisted retry: constrain the gate if it paused, then re-ask and re-evaluate.
    fn retry_step(
        &mut self,
        index: usize,
        prompt: &Prompt,
        contract: &Contract<'_>,
        progress: &mut TrialInProgress,
    ) -> Result<(), RunError> {
        if self.config.mode == ContractMode::Literal && progress.latest.gate() == GateState::Pause {
            self.apply_constraint(prompt, &progress.output, contract.expected_literal())?;
            progress.constraint_applied = true;
        }
        progress.retry_count_used += 1;
        progress.output = self.complete(prompt)?;
        progress.latest = self.evaluate(
            &trial_id(index, progress.retry_count_used),
            contract,
            &progress.output,
        )?;
        debug!(
            retry = progress.retry_count_used,
            exact = ?progress.latest.exact,
            "retry evaluated"
        );
        Ok(())
    }

    fn complete(&self, prompt: &Prompt) -> Result<String, RunError> {
        let request = CompletionRequest::from_config(self.config, &prompt.text);
        self.provider.request(&request).map_err(RunError::Provider)
    }

    fn evaluate(
        &self,
        trial_id: &str,
        contract: &Contract<'_>,
        output: &str,
    ) -> Result<Evaluation, RunError> {
        match (self.config.mode, contract) {
            (ContractMode::Structured, Contract::Structured { label, literal }) => {
                let verdict = classify_structured(output, label, literal);
                let exact = verdict.taxonomy == Taxonomy::ExactMatch;
                Ok(Evaluation {
                    exact: Some(exact),
                    taxonomy: Some(verdict.taxonomy),
                    diagnostics: Some(verdict.diagnostics),
                    gate: Some(if exact {
                        GateState::Continue
                    } else {
                        GateState::Pause
                    }),
                    ..Evaluation::default()
                })
            }
            (ContractMode::Structured, _) => Ok(Evaluation {
                gate: Some(GateState::Pause),
                ..Evaluation::default()
            }),
            (ContractMode::Literal, contract) => {
                let mut evaluation = self.consult_gate(trial_id, output)?;
                evaluation.exact = contract
                    .expected_literal()
                    .map(|literal| is_exact(literal, output));
                Ok(evaluation)
            }
        }
    }

    fn consult_gate(&self, trial_id: &str, output: &str) -> Result<Evaluation, RunError> {
        let observation = self
            .gate
            .observe(trial_id, output)
            .map_err(RunError::Gate)?;
        let decision = self
            .gate
            .decide(
                &observation.recommendation,
                output,
                self.active_constraint.as_deref(),
            )
            .map_err(RunError::Gate)?;
        Ok(Evaluation {
            gate: Some(decision.gate_state()),
            telemetry: observation.telemetry,
            reason_codes: decision.reason_codes,
            ..Evaluation::default()
        })
    }

    fn apply_constraint(
        &mut self,
        prompt: &Prompt,
        output: &str,
        expected_literal: Option<&str>,
    ) -> Result<(), RunError> {
        let proposal = self
            .proposer
            .propose(&TrialContext {
                prompt: &prompt.text,
                output,
                expected_literal,
            })
            .map_err(RunError::Proposal)?;
        if proposal.trim().is_empty() {
            return Err(RunError::Proposal(anyhow!("correction proposal is empty")));
        }
        self.gate
            .submit_constraint(&proposal)
            .map_err(RunError::Gate)?;
        debug!(chars = proposal.chars().count(), "constraint submitted");
        self.active_constraint = Some(proposal);
        Ok(())
    }

    fn pace(&self) {
        let mut remaining = self.config.pacing();
        while !remaining.is_zero() && !self.cancel.is_cancelled() {
            let slice = remaining.min(PACING_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
    }
}

/// Identifier sent to the gate for the initial output (`attempt == 0`) or a retry.
fn trial_id(index: usize, attempt: u32) -> String {
    if attempt == 0 {
        format!("trial-{index:04}")
    } else {
        format!("trial-{index:04}-retry-{attempt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::structured::expected_literal_for;
    use crate::io::gate::NoGate;
    use crate::test_support::{
        ScriptedGate, ScriptedProposer, ScriptedProvider, literal_prompt, uncontracted_prompt,
    };

    fn literal_config(assisted: bool) -> RunConfig {
        RunConfig {
            assisted,
            pacing_ms: 0,
            ..RunConfig::default()
        }
    }

    fn structured_prompt(id: &str, label: &str) -> Prompt {
        Prompt {
            id: id.to_string(),
            text: format!("Answer {label}"),
            expected_literal: Some(expected_literal_for(label)),
            expected_label: Some(label.to_string()),
            category: Some("structured".to_string()),
        }
    }

    fn no_sink(_: &Trial, _: &RunCounters) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn passive_literal_run_records_gate_and_exactness() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["42", "The answer is 42."]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let prompts = [literal_prompt("p1", "42"), literal_prompt("p2", "42")];
        let outcome = runner.run(&prompts, no_sink);
        assert!(matches!(outcome.stop, RunStop::Completed));
        assert_eq!(outcome.trials_emitted, 2);

        let trials = runner.trials();
        assert_eq!(trials[0].final_exact_match, Some(true));
        assert_eq!(trials[0].final_gate, GateState::Continue);
        assert_eq!(trials[1].initial_exact_match, Some(false));
        assert_eq!(trials[1].final_gate, GateState::Pause);
        assert_eq!(trials[1].retry_count_used, 0);
        assert_eq!(trials[1].reason_codes, vec!["literal_mismatch"]);
        assert_eq!(gate.observed(), vec!["trial-0000", "trial-0001"]);
        assert!(proposer.seen_outputs().is_empty());

        let counters = runner.counters();
        assert_eq!(counters.trials_emitted, 2);
        assert_eq!(counters.pause_count, 1);
        assert_eq!(counters.initial_pause_count, 1);
    }

    #[test]
    fn assisted_literal_retry_submits_constraint_and_corrects() {
        let cfg = literal_config(true);
        let provider = ScriptedProvider::new(["41", "42"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::new(["Reply with 42 only"]);
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let outcome = runner.run(&[literal_prompt("p1", "42")], no_sink);
        assert!(matches!(outcome.stop, RunStop::Completed));

        let trial = &runner.trials()[0];
        assert_eq!(trial.initial_output, "41");
        assert_eq!(trial.final_output, "42");
        assert_eq!(trial.initial_gate, GateState::Pause);
        assert_eq!(trial.final_gate, GateState::Continue);
        assert_eq!(trial.retry_count_used, 1);
        assert!(trial.correction_succeeded);
        assert!(trial.constraint_applied);
        assert_eq!(proposer.seen_outputs(), vec!["41"]);
        assert_eq!(gate.submitted(), vec!["Reply with 42 only"]);
        assert_eq!(
            gate.decide_constraints(),
            vec![None, Some("Reply with 42 only".to_string())]
        );
        assert_eq!(gate.observed(), vec!["trial-0000", "trial-0000-retry-1"]);
        assert_eq!(runner.active_constraint(), Some("Reply with 42 only"));
        assert_eq!(runner.counters().pause_count, 0);
    }

    #[test]
    fn retries_stop_at_the_cap() {
        let cfg = RunConfig {
            retry_cap: 2,
            ..literal_config(true)
        };
        let provider = ScriptedProvider::new(["41", "40", "39"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::new(["try 42", "really 42"]);
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        runner.run(&[literal_prompt("p1", "42")], no_sink);
        let trial = &runner.trials()[0];
        assert_eq!(trial.retry_count_used, 2);
        assert_eq!(trial.final_output, "39");
        assert!(!trial.correction_succeeded);
        assert_eq!(trial.final_gate, GateState::Pause);
        assert_eq!(provider.remaining(), 0);
    }

    #[test]
    fn yield_gate_retries_without_a_constraint() {
        let cfg = literal_config(true);
        let provider = ScriptedProvider::new(["41", "42"]);
        let gate = ScriptedGate::accepting(["42"]).otherwise("YIELD");
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        runner.run(&[literal_prompt("p1", "42")], no_sink);
        let trial = &runner.trials()[0];
        assert_eq!(trial.initial_gate, GateState::Yield);
        assert!(trial.correction_succeeded);
        assert!(!trial.constraint_applied);
        assert!(gate.submitted().is_empty());
    }

    #[test]
    fn missing_contract_is_absorbed() {
        let cfg = literal_config(true);
        let provider = ScriptedProvider::new(["hello", "42"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let prompts = [uncontracted_prompt("p0"), literal_prompt("p1", "42")];
        let outcome = runner.run(&prompts, no_sink);
        assert!(matches!(outcome.stop, RunStop::Completed));

        let trial = &runner.trials()[0];
        assert_eq!(trial.initial_exact_match, None);
        assert_eq!(trial.final_exact_match, None);
        assert_eq!(trial.retry_count_used, 0);
        assert!(
            trial
                .contract_error
                .as_deref()
                .is_some_and(|err| err.contains("p0"))
        );
        assert_eq!(trial.final_gate, GateState::Pause);
        assert_eq!(runner.trials()[1].final_exact_match, Some(true));
    }

    #[test]
    fn provider_failure_aborts_and_keeps_earlier_trials() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["42"]).then_fail("rate limited");
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let prompts = [
            literal_prompt("p1", "42"),
            literal_prompt("p2", "42"),
            literal_prompt("p3", "42"),
        ];
        let outcome = runner.run(&prompts, no_sink);
        match outcome.stop {
            RunStop::Aborted { trial_index, error } => {
                assert_eq!(trial_index, 1);
                assert_eq!(error.kind(), "provider");
                assert!(error.to_string().contains("rate limited"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(runner.trials().len(), 1);
        assert_eq!(runner.metrics().total_trials, 1);
    }

    #[test]
    fn empty_proposal_aborts_the_run() {
        let cfg = literal_config(true);
        let provider = ScriptedProvider::new(["41"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::new(["   "]);
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let outcome = runner.run(&[literal_prompt("p1", "42")], no_sink);
        assert!(matches!(
            outcome.stop,
            RunStop::Aborted {
                trial_index: 0,
                error: RunError::Proposal(_)
            }
        ));
        assert!(runner.trials().is_empty());
        assert!(gate.submitted().is_empty());
    }

    #[test]
    fn gate_failure_aborts_the_run() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["42"]);
        let gate = ScriptedGate::accepting(["42"]).failing("connection refused");
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let outcome = runner.run(&[literal_prompt("p1", "42")], no_sink);
        match outcome.stop {
            RunStop::Aborted { error, .. } => assert_eq!(error.kind(), "gate"),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn cancel_before_start_emits_nothing() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["42"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut runner =
            ExperimentRunner::new(&cfg, &provider, &gate, &proposer).with_cancel(cancel);

        let outcome = runner.run(&[literal_prompt("p1", "42")], no_sink);
        assert!(matches!(outcome.stop, RunStop::Cancelled { next_index: 0 }));
        assert!(runner.trials().is_empty());
        assert!(provider.prompts().is_empty());
    }

    #[test]
    fn cancel_from_sink_stops_before_next_trial() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["42", "42"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let cancel = CancelToken::new();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer)
            .with_cancel(cancel.clone());

        let prompts = [literal_prompt("p1", "42"), literal_prompt("p2", "42")];
        let outcome = runner.run(&prompts, |_, _| {
            cancel.cancel();
            Ok(())
        });
        assert!(matches!(outcome.stop, RunStop::Cancelled { next_index: 1 }));
        assert_eq!(runner.trials().len(), 1);
        assert_eq!(provider.remaining(), 1);
    }

    /// Delegates to a scripted provider and cancels the run on one call.
    struct CancelOnCall<'a> {
        inner: &'a ScriptedProvider,
        cancel: CancelToken,
        cancel_on: usize,
        calls: std::cell::Cell<usize>,
    }

    impl CompletionProvider for CancelOnCall<'_> {
        fn request(&self, request: &CompletionRequest<'_>) -> anyhow::Result<String> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if call == self.cancel_on {
                self.cancel.cancel();
            }
            self.inner.request(request)
        }
    }

    #[test]
    fn cancel_during_retry_finalizes_the_trial_in_flight() {
        let cfg = RunConfig {
            retry_cap: 3,
            ..literal_config(true)
        };
        let scripted = ScriptedProvider::new(["41", "40", "39", "42", "42"]);
        let cancel = CancelToken::new();
        let provider = CancelOnCall {
            inner: &scripted,
            cancel: cancel.clone(),
            cancel_on: 2,
            calls: std::cell::Cell::new(0),
        };
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::new(["try 42", "really 42", "only 42"]);
        let mut runner =
            ExperimentRunner::new(&cfg, &provider, &gate, &proposer).with_cancel(cancel);

        let prompts = [literal_prompt("p1", "42"), literal_prompt("p2", "42")];
        let outcome = runner.run(&prompts, no_sink);
        assert!(matches!(outcome.stop, RunStop::Cancelled { next_index: 1 }));
        assert_eq!(outcome.trials_emitted, 1);

        let trials = runner.trials();
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].final_output, "40");
        assert_eq!(trials[0].retry_count_used, 1);
        assert!(trials[0].retry_count_used < cfg.retry_cap);
        assert!(!trials[0].correction_succeeded);
        assert_eq!(provider.calls.get(), 2);
        assert_eq!(scripted.remaining(), 3);
        assert_eq!(proposer.seen_outputs(), vec!["41"]);
    }

    #[test]
    fn sink_failure_aborts_with_publish_error() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["42"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let outcome = runner.run(&[literal_prompt("p1", "42")], |_, _| {
            Err(anyhow!("disk full"))
        });
        match outcome.stop {
            RunStop::Aborted { trial_index, error } => {
                assert_eq!(trial_index, 0);
                assert_eq!(error.kind(), "publish");
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(runner.trials().len(), 1);
    }

    #[test]
    fn sink_sees_counters_after_each_trial() {
        let cfg = literal_config(false);
        let provider = ScriptedProvider::new(["41", "42"]);
        let gate = ScriptedGate::accepting(["42"]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, &gate, &proposer);

        let mut seen = Vec::new();
        let prompts = [literal_prompt("p1", "42"), literal_prompt("p2", "42")];
        runner.run(&prompts, |trial, counters| {
            seen.push((trial.index, counters.trials_emitted, counters.pause_count));
            Ok(())
        });
        assert_eq!(seen, vec![(0, 1, 1), (1, 2, 1)]);
    }

    #[test]
    fn structured_run_gates_locally() {
        let cfg = RunConfig {
            mode: ContractMode::Structured,
            ..literal_config(false)
        };
        let provider = ScriptedProvider::new([
            expected_literal_for("A"),
            "{\"result\":{\"answer\":\"C\",\"confidence\":0.75},\"meta\":{\"version\":1}}".to_string(),
        ]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, NoGate, &proposer);

        let prompts = [structured_prompt("s1", "A"), structured_prompt("s2", "B")];
        let outcome = runner.run(&prompts, no_sink);
        assert!(matches!(outcome.stop, RunStop::Completed));

        let trials = runner.trials();
        assert_eq!(trials[0].taxonomy, Some(Taxonomy::ExactMatch));
        assert_eq!(trials[0].final_gate, GateState::Continue);
        assert_eq!(trials[1].taxonomy, Some(Taxonomy::SemanticHardFailure));
        assert_eq!(trials[1].final_gate, GateState::Pause);
        assert!(trials[1].diagnostics.is_some_and(|d| d.semantic_hard_failure));
    }

    #[test]
    fn structured_prompt_without_label_pauses() {
        let cfg = RunConfig {
            mode: ContractMode::Structured,
            ..literal_config(true)
        };
        let provider = ScriptedProvider::new([expected_literal_for("A")]);
        let proposer = ScriptedProposer::default();
        let mut runner = ExperimentRunner::new(&cfg, &provider, NoGate, &proposer);

        let mut prompt = structured_prompt("s1", "A");
        prompt.expected_label = None;
        runner.run(&[prompt], no_sink);

        let trial = &runner.trials()[0];
        assert_eq!(trial.taxonomy, None);
        assert_eq!(trial.final_gate, GateState::Pause);
        assert_eq!(trial.retry_count_used, 0);
        assert!(trial.contract_error.is_some());
    }

    #[test]
    fn gate_ids_are_zero_padded() {
        assert_eq!(trial_id(7, 0), "trial-0007");
        assert_eq!(trial_id(7, 2), "trial-0007-retry-2");
    }
}
