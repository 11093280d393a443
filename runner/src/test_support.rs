//! Scripted collaborators for driving the experiment runner in tests.
//!
//! Each double replays a fixed script and records what it was asked, so tests
//! can assert on both the finalized trials and the calls that produced them.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use anyhow::{Result, anyhow, bail};

use crate::core::types::Prompt;
use crate::io::gate::{GateDecision, GateObserver, Observation};
use crate::io::proposer::{ConstraintProposer, TrialContext};
use crate::io::provider::{CompletionProvider, CompletionRequest};

/// Literal-contract prompt.
pub fn literal_prompt(id: &str, expected: &str) -> Prompt {
    Prompt {
        id: id.to_string(),
        text: format!("Reply with exactly: {expected}"),
        expected_literal: Some(expected.to_string()),
        expected_label: None,
        category: None,
    }
}

/// Prompt with no contract at all.
pub fn uncontracted_prompt(id: &str) -> Prompt {
    Prompt {
        id: id.to_string(),
        text: "Say something".to_string(),
        expected_literal: None,
        expected_label: None,
        category: None,
    }
}

/// Replays completions in order; a scripted failure aborts the call.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: RefCell<VecDeque<Result<String, String>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Queue a failing call after the replies scripted so far.
    pub fn then_fail(self, message: &str) -> Self {
        self.replies.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl CompletionProvider for ScriptedProvider {
    fn request(&self, request: &CompletionRequest<'_>) -> Result<String> {
        self.prompts.borrow_mut().push(request.prompt.to_string());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("scripted provider exhausted"),
        }
    }
}

/// Gate that continues on accepted texts and answers `otherwise` for the rest.
#[derive(Debug)]
pub struct ScriptedGate {
    accepted: HashSet<String>,
    otherwise: String,
    failure: Option<String>,
    observed: RefCell<Vec<String>>,
    decide_constraints: RefCell<Vec<Option<String>>>,
    submitted: RefCell<Vec<String>>,
}

impl ScriptedGate {
    /// Continue on any of `texts`, pause on everything else.
    pub fn accepting<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: texts.into_iter().map(Into::into).collect(),
            otherwise: "PAUSE".to_string(),
            failure: None,
            observed: RefCell::new(Vec::new()),
            decide_constraints: RefCell::new(Vec::new()),
            submitted: RefCell::new(Vec::new()),
        }
    }

    /// Raw decision returned for texts that are not accepted.
    pub fn otherwise(mut self, decision: &str) -> Self {
        self.otherwise = decision.to_string();
        self
    }

    /// Fail every `observe` call.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Trial ids passed to `observe`.
    pub fn observed(&self) -> Vec<String> {
        self.observed.borrow().clone()
    }

    /// Constraint passed to each `decide` call.
    pub fn decide_constraints(&self) -> Vec<Option<String>> {
        self.decide_constraints.borrow().clone()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.borrow().clone()
    }
}

impl GateObserver for ScriptedGate {
    fn observe(&self, trial_id: &str, text: &str) -> Result<Observation> {
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        self.observed.borrow_mut().push(trial_id.to_string());
        let recommendation = if self.accepted.contains(text) {
            "CONTINUE"
        } else {
            self.otherwise.as_str()
        };
        Ok(Observation {
            recommendation: recommendation.to_string(),
            telemetry: Some(serde_json::json!({ "chars": text.chars().count() })),
        })
    }

    fn decide(
        &self,
        recommendation: &str,
        text: &str,
        constraint: Option<&str>,
    ) -> Result<GateDecision> {
        self.decide_constraints
            .borrow_mut()
            .push(constraint.map(str::to_string));
        let reason_codes = if self.accepted.contains(text) {
            Vec::new()
        } else {
            vec!["literal_mismatch".to_string()]
        };
        Ok(GateDecision {
            decision: recommendation.to_string(),
            reason_codes,
        })
    }

    fn submit_constraint(&self, constraint: &str) -> Result<()> {
        self.submitted.borrow_mut().push(constraint.to_string());
        Ok(())
    }
}

/// Replays proposals in order and records the outputs it was shown.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    proposals: RefCell<VecDeque<String>>,
    seen_outputs: RefCell<Vec<String>>,
}

impl ScriptedProposer {
    pub fn new<I, S>(proposals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            proposals: RefCell::new(proposals.into_iter().map(Into::into).collect()),
            seen_outputs: RefCell::new(Vec::new()),
        }
    }

    pub fn seen_outputs(&self) -> Vec<String> {
        self.seen_outputs.borrow().clone()
    }
}

impl ConstraintProposer for ScriptedProposer {
    fn propose(&self, context: &TrialContext<'_>) -> Result<String> {
        self.seen_outputs.borrow_mut().push(context.output.to_string());
        self.proposals
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted proposer exhausted"))
    }
}
