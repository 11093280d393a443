//! Structured (nested-object) contract classification.
//!
//! The contract is a fixed two-level object:
//!
//! ```json
//! {"result":{"answer":"B","confidence":0.75},"meta":{"version":1}}
//! ```
//!
//! Key order is part of the contract, so parsing relies on `serde_json`'s
//! `preserve_order` map.

use serde_json::{Map, Value};

use crate::core::types::{StructuredDiagnostics, Taxonomy};

/// Labels the `answer` field may take.
pub const ALLOWED_LABELS: [&str; 4] = ["A", "B", "C", "D"];
/// Required `result.confidence` value.
pub const REQUIRED_CONFIDENCE: f64 = 0.75;
/// Required `meta.version` value.
pub const REQUIRED_VERSION: i64 = 1;

const TOP_LEVEL_KEYS: [&str; 2] = ["result", "meta"];
const RESULT_KEYS: [&str; 2] = ["answer", "confidence"];
const META_KEYS: [&str; 1] = ["version"];

/// Verdict plus sub-check flags for one structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredVerdict {
    pub taxonomy: Taxonomy,
    pub diagnostics: StructuredDiagnostics,
}

/// Canonical compact encoding of the contract for `label`.
pub fn expected_literal_for(label: &str) -> String {
    format!(
        r#"{{"result":{{"answer":"{label}","confidence":{REQUIRED_CONFIDENCE}}},"meta":{{"version":{REQUIRED_VERSION}}}}}"#
    )
}

/// Classify one output against the structured contract.
pub fn classify_structured(
    raw_output: &str,
    expected_label: &str,
    expected_literal: &str,
) -> StructuredVerdict {
    let raw_match = raw_output == expected_literal;
    let mut diagnostics = StructuredDiagnostics {
        raw_match,
        ..StructuredDiagnostics::default()
    };

    let parsed: Option<Value> = serde_json::from_str(raw_output.trim()).ok();
    diagnostics.parse_valid = parsed.is_some();

    let checks = parsed.as_ref().and_then(Value::as_object).map(check_object);
    if let Some(checks) = &checks {
        diagnostics.key_order_valid = checks.key_order_valid();
        diagnostics.schema_valid = checks.schema_valid();
    }

    let taxonomy = if raw_match {
        Taxonomy::ExactMatch
    } else {
        match (&parsed, &checks) {
            (None, _) => Taxonomy::NonJsonOutput,
            (Some(_), None) => Taxonomy::SchemaViolation,
            (Some(_), Some(checks)) if !checks.schema_valid() => Taxonomy::SchemaViolation,
            (Some(_), Some(checks)) => {
                if checks.answer.as_deref() == Some(expected_label) {
                    Taxonomy::FormatOnlyDrift
                } else {
                    Taxonomy::SemanticHardFailure
                }
            }
        }
    };
    diagnostics.semantic_hard_failure = taxonomy == Taxonomy::SemanticHardFailure;

    StructuredVerdict {
        taxonomy,
        diagnostics,
    }
}

/// Individual sub-check results for a parsed top-level object.
#[derive(Debug, Default)]
struct ObjectChecks {
    top_keys: bool,
    result_keys: bool,
    meta_keys: bool,
    answer_allowed: bool,
    confidence: bool,
    version: bool,
    answer: Option<String>,
}

impl ObjectChecks {
    fn key_order_valid(&self) -> bool {
        self.top_keys && self.result_keys && self.meta_keys
    }

    fn schema_valid(&self) -> bool {
        self.key_order_valid() && self.answer_allowed && self.confidence && self.version
    }
}

fn check_object(root: &Map<String, Value>) -> ObjectChecks {
    let mut checks = ObjectChecks {
        top_keys: keys_are(root, &TOP_LEVEL_KEYS),
        ..ObjectChecks::default()
    };

    if let Some(result) = root.get("result").and_then(Value::as_object) {
        checks.result_keys = keys_are(result, &RESULT_KEYS);
        if let Some(answer) = result.get("answer").and_then(Value::as_str) {
            checks.answer_allowed = ALLOWED_LABELS.contains(&answer);
            checks.answer = Some(answer.to_string());
        }
        checks.confidence = result
            .get("confidence")
            .and_then(Value::as_f64)
            .is_some_and(|value| value == REQUIRED_CONFIDENCE);
    }

    if let Some(meta) = root.get("meta").and_then(Value::as_object) {
        checks.meta_keys = keys_are(meta, &META_KEYS);
        checks.version = meta
            .get("version")
            .and_then(Value::as_i64)
            .is_some_and(|value| value == REQUIRED_VERSION);
    }

    checks
}

fn keys_are(object: &Map<String, Value>, expected: &[&str]) -> bool {
    object.len() == expected.len()
        && object
            .keys()
            .zip(expected.iter())
            .all(|(actual, wanted)| actual == wanted)
}
