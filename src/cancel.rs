//! Cooperative cancellation.
//!
//! The operator's interrupt is delivered asynchronously (a Ctrl+C watcher
//! thread in the CLI) and only sets a flag. The sequencer polls the flag at
//! every suspension point and unwinds through its shutdown step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-arms the token before the next sweep.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
