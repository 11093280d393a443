//! Stable exit codes for `contract-runner` commands.

/// Command succeeded; `run` finished every prompt.
pub const OK: i32 = 0;
/// Invalid config, prompts or arguments, or any other error before a run starts.
pub const INVALID: i32 = 1;
/// `run` stopped on a provider, gate, proposal or publication failure.
pub const ABORTED: i32 = 2;
/// `run` observed cancellation (stop file) before finishing.
pub const CANCELLED: i32 = 3;
