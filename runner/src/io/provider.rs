//! Completion provider abstraction.
//!
//! The [`CompletionProvider`] trait decouples the experiment runner from the
//! model backend. Tests use scripted providers that return predetermined
//! outputs without spawning processes.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::io::config::{ProviderConfig, RunConfig};
use crate::io::process::{CommandCall, run_command};

/// Parameters for one completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub system_prompt: Option<&'a str>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl<'a> CompletionRequest<'a> {
    /// Request for `prompt` using the model parameters of `cfg`.
    pub fn from_config(cfg: &'a RunConfig, prompt: &'a str) -> Self {
        Self {
            model: &cfg.model,
            prompt,
            system_prompt: cfg.system_prompt.as_deref(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }
}

/// Abstraction over completion backends.
///
/// Transient failures (timeouts, rate limits) and fatal ones (bad
/// credentials) are both plain errors; the runner aborts on either.
pub trait CompletionProvider {
    fn request(&self, request: &CompletionRequest<'_>) -> Result<String>;
}

impl<P: CompletionProvider + ?Sized> CompletionProvider for &P {
    fn request(&self, request: &CompletionRequest<'_>) -> Result<String> {
        (**self).request(request)
    }
}

/// Provider that runs a configured command per completion.
///
/// The request is written to stdin as one JSON object; the completion is
/// read from stdout. A single trailing newline is treated as framing and
/// removed, every other byte is kept.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl CompletionProvider for CommandProvider {
    #[instrument(skip_all, fields(model = request.model))]
    fn request(&self, request: &CompletionRequest<'_>) -> Result<String> {
        let payload = serde_json::to_vec(request).context("serialize completion request")?;
        let output = run_command(&CommandCall {
            argv: &self.command,
            extra_args: &[],
            stdin: &payload,
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })
        .context("run provider command")?;
        let text = strip_framing_newline(output.into_stdout("provider command")?);
        debug!(bytes = text.len(), "completion received");
        Ok(text)
    }
}

fn strip_framing_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(script: &str) -> CommandProvider {
        CommandProvider::new(&ProviderConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 5,
            output_limit_bytes: 10_000,
        })
    }

    #[test]
    fn command_receives_json_request() {
        let cfg = RunConfig {
            model: "tiny".to_string(),
            system_prompt: Some("Be exact.".to_string()),
            ..RunConfig::default()
        };
        let request = CompletionRequest::from_config(&cfg, "Reply with 42");
        let text = provider("cat").request(&request).expect("request");
        let echoed: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(echoed["model"], "tiny");
        assert_eq!(echoed["prompt"], "Reply with 42");
        assert_eq!(echoed["system_prompt"], "Be exact.");
        assert_eq!(echoed["max_tokens"], 256);
    }

    #[test]
    fn only_one_trailing_newline_is_removed() {
        let cfg = RunConfig::default();
        let request = CompletionRequest::from_config(&cfg, "x");
        let text = provider("cat >/dev/null; printf ' 42 \\n\\n'")
            .request(&request)
            .expect("request");
        assert_eq!(text, " 42 \n");
    }

    #[test]
    fn failing_command_is_an_error() {
        let cfg = RunConfig::default();
        let request = CompletionRequest::from_config(&cfg, "x");
        let err = provider("cat >/dev/null; echo 'invalid api key' >&2; exit 1")
            .request(&request)
            .expect_err("failure");
        assert!(format!("{err:#}").contains("invalid api key"));
    }

    #[test]
    fn framing_strips_crlf() {
        assert_eq!(strip_framing_newline("42\r\n".to_string()), "42");
        assert_eq!(strip_framing_newline("42".to_string()), "42");
    }
}
