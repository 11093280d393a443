//! Correction-constraint proposals for assisted literal runs.

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use tracing::{debug, instrument};

use crate::io::provider::{CompletionProvider, CompletionRequest};

const CORRECTION_TEMPLATE: &str = include_str!("templates/correction.md");

/// What the proposer sees about a failing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialContext<'a> {
    pub prompt: &'a str,
    pub output: &'a str,
    pub expected_literal: Option<&'a str>,
}

pub trait ConstraintProposer {
    /// Produce a non-empty correction constraint for a failing output.
    fn propose(&self, context: &TrialContext<'_>) -> Result<String>;
}

impl<C: ConstraintProposer + ?Sized> ConstraintProposer for &C {
    fn propose(&self, context: &TrialContext<'_>) -> Result<String> {
        (**self).propose(context)
    }
}

/// Proposer that asks a completion provider to write the constraint.
pub struct PromptedProposer<P> {
    provider: P,
    model: String,
    max_tokens: u32,
    max_chars: usize,
    env: Environment<'static>,
}

impl<P: CompletionProvider> PromptedProposer<P> {
    pub fn new(provider: P, model: &str, max_tokens: u32, max_chars: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("correction", CORRECTION_TEMPLATE)
            .context("load correction template")?;
        Ok(Self {
            provider,
            model: model.to_string(),
            max_tokens,
            max_chars,
            env,
        })
    }

    fn render(&self, trial: &TrialContext<'_>) -> Result<String> {
        let template = self.env.get_template("correction")?;
        let rendered = template.render(context! {
            prompt => trial.prompt.trim(),
            output => trial.output,
            expected_literal => trial.expected_literal,
        })?;
        Ok(rendered)
    }
}

impl<P: CompletionProvider> ConstraintProposer for PromptedProposer<P> {
    #[instrument(skip_all, fields(max_chars = self.max_chars))]
    fn propose(&self, trial: &TrialContext<'_>) -> Result<String> {
        let prompt = self.render(trial).context("render correction prompt")?;
        let request = CompletionRequest {
            model: &self.model,
            prompt: &prompt,
            system_prompt: None,
            temperature: 0.0,
            max_tokens: self.max_tokens,
        };
        let proposal = self
            .provider
            .request(&request)
            .context("request correction proposal")?;
        let proposal = truncate_chars(proposal.trim(), self.max_chars);
        if proposal.is_empty() {
            bail!("correction proposal is empty");
        }
        debug!(chars = proposal.chars().count(), "proposal ready");
        Ok(proposal)
    }
}

/// First `max_chars` characters of `text`, never splitting a code point.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].trim_end().to_string(),
        None => text.to_string(),
    }
}
