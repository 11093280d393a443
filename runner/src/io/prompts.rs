//! Prompt sources: JSONL files and procedurally generated structured prompts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::structured::{ALLOWED_LABELS, expected_literal_for};
use crate::core::types::Prompt;

const STRUCTURED_TEMPLATE: &str = include_str!("templates/structured_instruction.md");

/// Category assigned to generated structured prompts.
pub const STRUCTURED_CATEGORY: &str = "structured";

/// Read prompts from a JSONL file. Blank lines are skipped.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_prompts_jsonl(path: &Path) -> Result<Vec<Prompt>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read prompts {}", path.display()))?;
    let prompts = parse_prompts_jsonl(&contents)
        .with_context(|| format!("parse prompts {}", path.display()))?;
    debug!(count = prompts.len(), "prompts loaded");
    Ok(prompts)
}

pub fn parse_prompts_jsonl(contents: &str) -> Result<Vec<Prompt>> {
    let mut prompts = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let prompt: Prompt =
            serde_json::from_str(line).with_context(|| format!("line {}", idx + 1))?;
        if prompt.id.trim().is_empty() {
            bail!("line {}: prompt id must be non-empty", idx + 1);
        }
        prompts.push(prompt);
    }
    Ok(prompts)
}

/// Generate `count` structured prompts with labels cycling `A, B, C, D`.
///
/// Each instruction embeds the exact literal the contract expects.
pub fn generate_structured_prompts(count: usize) -> Result<Vec<Prompt>> {
    let mut env = Environment::new();
    env.add_template("structured", STRUCTURED_TEMPLATE)
        .context("load structured instruction template")?;
    let template = env.get_template("structured")?;

    (0..count)
        .map(|idx| {
            let label = ALLOWED_LABELS[idx % ALLOWED_LABELS.len()];
            let literal = expected_literal_for(label);
            let text = template
                .render(context! { number => idx + 1, label => label, literal => &literal })
                .context("render structured instruction")?;
            Ok(Prompt {
                id: format!("structured-{:03}", idx + 1),
                text,
                expected_literal: Some(literal),
                expected_label: Some(label.to_string()),
                category: Some(STRUCTURED_CATEGORY.to_string()),
            })
        })
        .collect()
}

/// Serialize prompts back to JSONL.
pub fn write_prompts_jsonl(path: &Path, prompts: &[Prompt]) -> Result<()> {
    let mut buf = String::new();
    for prompt in prompts {
        buf.push_str(&serde_json::to_string(prompt).context("serialize prompt")?);
        buf.push('\n');
    }
    super::write_atomic(path, &buf)
}

/// Hex SHA-256 of the prompt records, used to identify a prompt set.
pub fn prompts_sha256(prompts: &[Prompt]) -> Result<String> {
    let mut hasher = Sha256::new();
    for prompt in prompts {
        hasher.update(serde_json::to_vec(prompt).context("serialize prompt")?);
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_skips_blank_lines_and_accepts_camel_case() {
        let contents = concat!(
            "{\"id\":\"p1\",\"text\":\"Reply with 42\",\"expectedLiteral\":\"42\"}\n",
            "\n",
            "   \n",
            "{\"id\":\"p2\",\"text\":\"Say hi\",\"category\":\"greeting\"}\n",
        );
        let prompts = parse_prompts_jsonl(contents).expect("parse");
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].expected_literal.as_deref(), Some("42"));
        assert_eq!(prompts[1].expected_literal, None);
        assert_eq!(prompts[1].category.as_deref(), Some("greeting"));
    }

    #[test]
    fn jsonl_errors_name_the_line() {
        let contents = "{\"id\":\"p1\",\"text\":\"ok\"}\n\n{not json}\n";
        let err = parse_prompts_jsonl(contents).expect_err("invalid");
        assert!(format!("{err:#}").contains("line 3"));
    }

    #[test]
    fn load_reads_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prompts.jsonl");
        fs::write(&path, "{\"id\":\"p1\",\"text\":\"Reply with 42\"}\n").expect("write");
        let prompts = load_prompts_jsonl(&path).expect("load");
        assert_eq!(prompts[0].id, "p1");
    }

    #[test]
    fn structured_prompts_cycle_labels() {
        let prompts = generate_structured_prompts(5).expect("generate");
        let labels: Vec<_> = prompts
            .iter()
            .map(|prompt| prompt.expected_label.as_deref().unwrap_or(""))
            .collect();
        assert_eq!(labels, ["A", "B", "C", "D", "A"]);
        assert_eq!(prompts[0].id, "structured-001");
        assert_eq!(prompts[1].category.as_deref(), Some("structured"));

        let literal = prompts[1].expected_literal.as_deref().expect("literal");
        assert_eq!(
            literal,
            r#"{"result":{"answer":"B","confidence":0.75},"meta":{"version":1}}"#
        );
        assert!(prompts[1].text.contains(literal));
    }

    #[test]
    fn generated_prompts_survive_a_jsonl_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("structured.jsonl");
        let prompts = generate_structured_prompts(4).expect("generate");
        write_prompts_jsonl(&path, &prompts).expect("write");
        assert_eq!(load_prompts_jsonl(&path).expect("load"), prompts);
    }

    #[test]
    fn digest_changes_with_content() {
        let a = generate_structured_prompts(2).expect("generate");
        let b = generate_structured_prompts(3).expect("generate");
        let digest = prompts_sha256(&a).expect("digest");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, prompts_sha256(&a).expect("digest"));
        assert_ne!(digest, prompts_sha256(&b).expect("digest"));
    }
}
