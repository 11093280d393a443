//! Run-scoped cancellation.
//!
//! The runner samples the token only at trial and retry boundaries, so a
//! cancel never interrupts an outbound call.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Cloneable cancellation flag shared between the runner and its owner.
///
/// When a stop file is configured, its appearance also counts as a cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat the existence of `path` as a cancel request.
    pub fn with_stop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stop_file = Some(path.into());
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.stop_file
            && path.exists()
        {
            info!(stop_file = %path.display(), "stop file found, cancelling run");
            self.cancel();
            return true;
        }
        false
    }
}
