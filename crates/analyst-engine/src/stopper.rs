//! Cooperative cancellation flag shared by every worker of a run

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set-once stop signal
///
/// Workers poll it between units of work; nothing is interrupted. Clones
/// share the same flag and it is never cleared.
#[derive(Debug, Clone, Default)]
pub struct Stopper {
    flag: Arc<AtomicBool>,
}

impl Stopper {
    /// Create an unset stopper
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag (idempotent)
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the flag was raised
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
