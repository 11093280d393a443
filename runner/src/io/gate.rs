//! Gate observer adapter.
//!
//! Literal runs ask an external observer whether each output may be accepted.
//! The observer sees the output (`observe`), turns its recommendation into a
//! decision (`decide`), and stores correction constraints submitted by the
//! runner (`submit_constraint`).

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::GateState;
use crate::io::config::GateConfig;
use crate::io::process::{CommandCall, run_command};

/// Upper bound on a gate response.
const GATE_OUTPUT_LIMIT_BYTES: usize = 256_000;

/// Observer response for one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub recommendation: String,
    #[serde(default)]
    pub telemetry: Option<Value>,
}

/// Decision for one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Raw decision; mapped through [`GateState::from_decision`].
    pub decision: String,
    #[serde(default)]
    pub reason_codes: Vec<String>,
}

impl GateDecision {
    pub fn gate_state(&self) -> GateState {
        GateState::from_decision(&self.decision)
    }
}

pub trait GateObserver {
    fn observe(&self, trial_id: &str, text: &str) -> Result<Observation>;

    fn decide(
        &self,
        recommendation: &str,
        text: &str,
        constraint: Option<&str>,
    ) -> Result<GateDecision>;

    /// Persist a correction constraint for later decisions.
    fn submit_constraint(&self, constraint: &str) -> Result<()>;
}

impl<G: GateObserver + ?Sized> GateObserver for &G {
    fn observe(&self, trial_id: &str, text: &str) -> Result<Observation> {
        (**self).observe(trial_id, text)
    }

    fn decide(
        &self,
        recommendation: &str,
        text: &str,
        constraint: Option<&str>,
    ) -> Result<GateDecision> {
        (**self).decide(recommendation, text, constraint)
    }

    fn submit_constraint(&self, constraint: &str) -> Result<()> {
        (**self).submit_constraint(constraint)
    }
}

/// Stand-in for runs that never consult an external gate (structured mode).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGate;

impl GateObserver for NoGate {
    fn observe(&self, _trial_id: &str, _text: &str) -> Result<Observation> {
        bail!("no gate observer configured")
    }

    fn decide(
        &self,
        _recommendation: &str,
        _text: &str,
        _constraint: Option<&str>,
    ) -> Result<GateDecision> {
        bail!("no gate observer configured")
    }

    fn submit_constraint(&self, _constraint: &str) -> Result<()> {
        bail!("no gate observer configured")
    }
}

/// Observer backed by a command: `<command> observe|decide|constraint`.
///
/// Each call writes a JSON request on stdin. `observe` and `decide` must
/// print one JSON response on stdout; `constraint` only needs to exit 0.
#[derive(Debug, Clone)]
pub struct CommandGateObserver {
    command: Vec<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ObserveRequest<'a> {
    trial_id: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    recommendation: &'a str,
    text: &'a str,
    constraint: Option<&'a str>,
}

#[derive(Serialize)]
struct ConstraintRequest<'a> {
    constraint: &'a str,
}

impl CommandGateObserver {
    pub fn new(cfg: &GateConfig) -> Result<Self> {
        if cfg.command.is_empty() {
            bail!("gate.command must be a non-empty array");
        }
        Ok(Self {
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }

    fn call<T: Serialize>(&self, verb: &str, request: &T) -> Result<String> {
        let payload = serde_json::to_vec(request).context("serialize gate request")?;
        let output = run_command(&CommandCall {
            argv: &self.command,
            extra_args: &[verb],
            stdin: &payload,
            timeout: self.timeout,
            output_limit_bytes: GATE_OUTPUT_LIMIT_BYTES,
        })
        .with_context(|| format!("run gate {verb}"))?;
        output.into_stdout(&format!("gate {verb}"))
    }
}

impl GateObserver for CommandGateObserver {
    #[instrument(skip_all, fields(trial_id = trial_id))]
    fn observe(&self, trial_id: &str, text: &str) -> Result<Observation> {
        let stdout = self.call("observe", &ObserveRequest { trial_id, text })?;
        let observation: Observation =
            serde_json::from_str(stdout.trim()).context("parse gate observe response")?;
        debug!(recommendation = %observation.recommendation, "observed");
        Ok(observation)
    }

    #[instrument(skip_all, fields(recommendation = recommendation, constrained = constraint.is_some()))]
    fn decide(
        &self,
        recommendation: &str,
        text: &str,
        constraint: Option<&str>,
    ) -> Result<GateDecision> {
        let stdout = self.call(
            "decide",
            &DecideRequest {
                recommendation,
                text,
                constraint,
            },
        )?;
        let decision: GateDecision =
            serde_json::from_str(stdout.trim()).context("parse gate decide response")?;
        debug!(decision = %decision.decision, "decided");
        Ok(decision)
    }

    #[instrument(skip_all, fields(chars = constraint.chars().count()))]
    fn submit_constraint(&self, constraint: &str) -> Result<()> {
        self.call("constraint", &ConstraintRequest { constraint })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gate script that pauses unless the text is exactly `42`.
    const SCRIPT: &str = r#"
input=$(cat)
case "$0" in
  observe) printf '{"recommendation":"PAUSE","telemetry":{"seen":true}}' ;;
  decide)
    case "$input" in
      *'"text":"42"'*) printf '{"decision":"CONTINUE","reason_codes":[]}' ;;
      *) printf '{"decision":"DEFER","reason_codes":["literal_mismatch"]}' ;;
    esac ;;
  constraint) : ;;
  *) exit 2 ;;
esac
"#;

    fn observer(script: &str) -> CommandGateObserver {
        CommandGateObserver::new(&GateConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 5,
        })
        .expect("observer")
    }

    #[test]
    fn observe_parses_recommendation_and_telemetry() {
        let observation = observer(SCRIPT).observe("trial-0", "41").expect("observe");
        assert_eq!(observation.recommendation, "PAUSE");
        assert_eq!(
            observation.telemetry,
            Some(serde_json::json!({"seen": true}))
        );
    }

    #[test]
    fn decide_maps_defer_to_pause() {
        let gate = observer(SCRIPT);
        let paused = gate.decide("PAUSE", "41", None).expect("decide");
        assert_eq!(paused.gate_state(), GateState::Pause);
        assert_eq!(paused.reason_codes, vec!["literal_mismatch"]);

        let accepted = gate.decide("PAUSE", "42", Some("Reply with 42 only")).expect("decide");
        assert_eq!(accepted.gate_state(), GateState::Continue);
    }

    #[test]
    fn constraint_submission_needs_only_success() {
        observer(SCRIPT)
            .submit_constraint("Reply with 42 only")
            .expect("constraint");
    }

    #[test]
    fn malformed_response_is_an_error() {
        let gate = observer("cat >/dev/null; printf 'not json'");
        let err = gate.observe("trial-0", "41").expect_err("malformed");
        assert!(format!("{err:#}").contains("parse gate observe response"));
    }

    #[test]
    fn no_gate_refuses_every_call() {
        assert!(NoGate.observe("trial-0", "42").is_err());
        assert!(NoGate.decide("CONTINUE", "42", None).is_err());
        assert!(NoGate.submit_constraint("x").is_err());
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = CommandGateObserver::new(&GateConfig::default()).expect_err("empty");
        assert!(err.to_string().contains("gate.command"));
    }
}
