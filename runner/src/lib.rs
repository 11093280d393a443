//! Contract-compliance evaluation harness.
//!
//! Measures whether a completion engine reproduces an exact, pre-declared
//! output ("contract") over repeated trials, and whether a bounded
//! corrective-retry loop repairs non-compliant outputs. The crate keeps a
//! strict split:
//!
//! - **[`core`]**: pure, deterministic logic (classification, metrics,
//!   trial-log invariants). No I/O.
//! - **[`io`]**: side effects (config, prompt files, child processes, run
//!   artifacts) and the collaborator traits the runner is generic over.
//!
//! [`experiment`] drives trials over those collaborators and [`snapshot`]
//! packages a run for reporting.

pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod experiment;
pub mod io;
pub mod logging;
pub mod snapshot;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
