//! Literal-contract mismatch classification.
//!
//! Separates formatting drift (case, edge punctuation, whitespace, trailing
//! spillover) from semantic mismatches of the literal content.

use crate::core::types::MismatchKind;

/// Unicode punctuation accepted at output boundaries in addition to ASCII
/// punctuation.
const EXTRA_BOUNDARY_PUNCTUATION: &[char] = &[
    '\u{2026}', // …
    '\u{201C}', // “
    '\u{201D}', // ”
    '\u{2018}', // ‘
    '\u{2019}', // ’
    '\u{00AB}', // «
    '\u{00BB}', // »
    '\u{2013}', // –
    '\u{2014}', // —
    '\u{00A1}', // ¡
    '\u{00BF}', // ¿
    '\u{00B7}', // ·
    '\u{3001}', // 、
    '\u{3002}', // 。
    '\u{FF0C}', // ，
    '\u{FF01}', // ！
    '\u{FF1F}', // ？
    '\u{FF1A}', // ：
    '\u{FF1B}', // ；
];

/// Words before a trailing literal that negate it or offer an alternative.
const COMPETING_WORDS: &[&str] = &["not", "no", "never", "nor", "or", "neither"];

/// Raw byte equality against the contract literal.
pub fn is_exact(expected_literal: &str, raw_output: &str) -> bool {
    expected_literal == raw_output
}

/// Classify one output against one literal contract.
///
/// - `Exact` when `exact_match` is set.
/// - `SemanticHardFailure` when either boundary-normalized form is empty.
/// - `FormattingOnly` when the normalized forms are equal, or when the trimmed
///   literal starts the trimmed output and is followed by a boundary character.
/// - `FormattingOnly` when the trimmed literal closes the output (ignoring
///   trailing boundary characters) after a boundary, and the lead-in holds no
///   competing value: no negation or alternative word, and no other number
///   when the literal is numeric.
/// - `SemanticHardFailure` otherwise.
///
/// Both edge rules compare case-sensitively.
pub fn classify(expected_literal: &str, raw_output: &str, exact_match: bool) -> MismatchKind {
    if exact_match {
        return MismatchKind::Exact;
    }

    let expected_norm = boundary_normalize(expected_literal);
    let output_norm = boundary_normalize(raw_output);
    if expected_norm.is_empty() || output_norm.is_empty() {
        return MismatchKind::SemanticHardFailure;
    }
    if expected_norm == output_norm {
        return MismatchKind::FormattingOnly;
    }
    let expected = expected_literal.trim();
    let output = raw_output.trim();
    if prefix_with_boundary(expected, output) || suffix_with_boundary(expected, output) {
        return MismatchKind::FormattingOnly;
    }
    MismatchKind::SemanticHardFailure
}

/// Trim, strip edge whitespace/punctuation runs, then lowercase.
pub fn boundary_normalize(value: &str) -> String {
    value
        .trim()
        .trim_matches(is_boundary_char)
        .to_lowercase()
}

pub fn is_boundary_char(ch: char) -> bool {
    ch.is_whitespace() || ch.is_ascii_punctuation() || EXTRA_BOUNDARY_PUNCTUATION.contains(&ch)
}

fn prefix_with_boundary(expected: &str, output: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    match output.strip_prefix(expected) {
        Some(rest) => rest.chars().next().is_none_or(is_boundary_char),
        None => false,
    }
}

fn suffix_with_boundary(expected: &str, output: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let lead = output
        .strip_suffix(expected)
        .or_else(|| output.trim_end_matches(is_boundary_char).strip_suffix(expected));
    match lead {
        Some(lead) => {
            lead.chars().next_back().is_none_or(is_boundary_char)
                && !has_competing_value(lead, is_numeric(expected))
        }
        None => false,
    }
}

fn has_competing_value(lead: &str, numeric_literal: bool) -> bool {
    lead.split_whitespace()
        .map(|word| word.trim_matches(is_boundary_char).to_lowercase())
        .any(|word| {
            COMPETING_WORDS.contains(&word.as_str())
                || word.ends_with("n't")
                || word.ends_with("n\u{2019}t")
                || (numeric_literal && word.chars().any(|ch| ch.is_ascii_digit()))
        })
}

fn is_numeric(literal: &str) -> bool {
    literal.chars().any(|ch| ch.is_ascii_digit())
        && literal
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ',' | '-' | '+'))
}
