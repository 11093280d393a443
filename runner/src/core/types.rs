//! Shared deterministic types for contract evaluation.
//!
//! These types define stable contracts between the classifier, the experiment
//! runner and the snapshot consumers. They must not depend on external state or
//! I/O and serialize to a fixed field set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One prompt record read from a prompt source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub text: String,
    /// Byte-exact output the contract requires.
    #[serde(
        default,
        alias = "expectedLiteral",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_literal: Option<String>,
    /// Short label used by the structured contract (e.g. `"B"`).
    #[serde(
        default,
        alias = "expectedLabel",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Which contract shape a run evaluates against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractMode {
    /// Single byte-exact string, gated by the external observer.
    #[default]
    Literal,
    /// Fixed-schema nested object, gated locally from the taxonomy.
    Structured,
}

impl ContractMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractMode::Literal => "literal",
            ContractMode::Structured => "structured",
        }
    }
}

impl fmt::Display for ContractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "literal" => Ok(ContractMode::Literal),
            "structured" => Ok(ContractMode::Structured),
            other => Err(format!(
                "unknown contract mode {other:?} (expected literal or structured)"
            )),
        }
    }
}

/// Accept/pause/yield signal attached to a trial output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Continue,
    Pause,
    Yield,
}

impl GateState {
    /// Map a raw decision string from the gate service.
    ///
    /// `PAUSE` and `DEFER` pause, `YIELD` yields, anything else continues.
    pub fn from_decision(decision: &str) -> Self {
        match decision.trim().to_ascii_uppercase().as_str() {
            "PAUSE" | "DEFER" => GateState::Pause,
            "YIELD" => GateState::Yield,
            _ => GateState::Continue,
        }
    }
}

/// Literal-contract mismatch classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MismatchKind {
    Exact,
    FormattingOnly,
    SemanticHardFailure,
}

/// Structured-contract violation classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Taxonomy {
    ExactMatch,
    FormatOnlyDrift,
    SchemaViolation,
    SemanticHardFailure,
    NonJsonOutput,
}

impl Taxonomy {
    pub const ALL: [Taxonomy; 5] = [
        Taxonomy::ExactMatch,
        Taxonomy::FormatOnlyDrift,
        Taxonomy::SchemaViolation,
        Taxonomy::SemanticHardFailure,
        Taxonomy::NonJsonOutput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Taxonomy::ExactMatch => "EXACT_MATCH",
            Taxonomy::FormatOnlyDrift => "FORMAT_ONLY_DRIFT",
            Taxonomy::SchemaViolation => "SCHEMA_VIOLATION",
            Taxonomy::SemanticHardFailure => "SEMANTIC_HARD_FAILURE",
            Taxonomy::NonJsonOutput => "NON_JSON_OUTPUT",
        }
    }
}

/// Sub-check results recorded alongside a structured verdict.
///
/// Each flag is computed independently of the final taxonomy, so a
/// `SCHEMA_VIOLATION` may still report `key_order_valid = true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDiagnostics {
    pub raw_match: bool,
    pub parse_valid: bool,
    pub schema_valid: bool,
    pub key_order_valid: bool,
    pub semantic_hard_failure: bool,
}

/// A finalized trial. Never mutated after the runner emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Zero-based position in the run.
    pub index: usize,
    pub prompt_id: String,
    pub prompt: String,
    pub category: Option<String>,
    pub expected_literal: Option<String>,
    pub expected_label: Option<String>,
    pub initial_output: String,
    pub final_output: String,
    pub initial_gate: GateState,
    pub final_gate: GateState,
    /// Telemetry from the latest gate observation (literal mode only).
    pub telemetry: Option<Value>,
    /// Reason codes from the latest gate decision (literal mode only).
    pub reason_codes: Vec<String>,
    pub initial_exact_match: Option<bool>,
    pub final_exact_match: Option<bool>,
    pub retry_count_used: u32,
    pub correction_succeeded: bool,
    pub constraint_applied: bool,
    pub initial_taxonomy: Option<Taxonomy>,
    pub taxonomy: Option<Taxonomy>,
    pub diagnostics: Option<StructuredDiagnostics>,
    /// Set when the prompt carried no usable contract.
    pub contract_error: Option<String>,
}

impl Trial {
    pub fn has_contract(&self) -> bool {
        self.initial_exact_match.is_some()
    }

    pub fn initially_failed(&self) -> bool {
        self.initial_exact_match == Some(false)
    }
}
