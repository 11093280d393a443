//! Diagnostic tracing for the runner.
//!
//! - **Tracing (this module)**: `RUST_LOG`-filtered diagnostics on stderr.
//!   Not persisted.
//! - **Run artifacts (`io/trial_log`, `io/snapshot`)**: `trials.jsonl` and
//!   `snapshot.json` under the run directory. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: `RUST_LOG` filter (default `warn`), compact
/// stderr output.
///
/// ```bash
/// RUST_LOG=contract_runner=debug contract-runner run --prompts prompts.jsonl
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
