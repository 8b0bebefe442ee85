//! Progress reporting seam.
//!
//! The host tool owns all user-facing rendering; this crate only announces
//! which step of an operation is underway. The same trait serves interactive
//! steppers in the host tool and the logging reporter used headless.

use tracing::info;

/// Receives step announcements from the orchestrator and the queue engine.
pub trait ProgressReporter: Send + Sync {
    /// Announce the step that is starting (e.g. "Creating a network interface").
    fn start_step(&self, label: &str);
}

/// Reporter that narrates through structured logging.
#[derive(Debug, Default)]
pub struct LogReporter;

impl LogReporter {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressReporter for LogReporter {
    fn start_step(&self, label: &str) {
        info!(step = %label, "Starting step");
    }
}

/// Reporter that discards all announcements.
#[derive(Debug, Default)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn start_step(&self, _label: &str) {}
}
