//! Error taxonomy for experiment runs.
//!
//! Only [`ContractError`] is absorbed per trial. Every [`RunError`] aborts the
//! run; trials finalized before the failure stay valid.

use thiserror::Error;

/// A prompt carries no well-formed contract for the selected mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("prompt {prompt_id} has no usable contract: {reason}")]
pub struct ContractError {
    pub prompt_id: String,
    pub reason: String,
}

/// Fatal failures raised by an injected collaborator.
#[derive(Debug, Error)]
pub enum RunError {
    /// The completion call failed (transient or fatal alike).
    #[error("completion request failed: {0:#}")]
    Provider(#[source] anyhow::Error),
    /// The gate observer was unreachable or answered malformed data.
    #[error("gate observer failed: {0:#}")]
    Gate(#[source] anyhow::Error),
    /// The correction proposal was empty or could not be produced.
    #[error("constraint proposal failed: {0:#}")]
    Proposal(#[source] anyhow::Error),
    /// A finalized trial could not be handed to the trial sink.
    #[error("trial publication failed: {0:#}")]
    Publish(#[source] anyhow::Error),
}

impl RunError {
    /// Stable label used in snapshots and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Provider(_) => "provider",
            RunError::Gate(_) => "gate",
            RunError::Proposal(_) => "proposal",
            RunError::Publish(_) => "publish",
        }
    }
}
