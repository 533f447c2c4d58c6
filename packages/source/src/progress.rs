//! Progress reporting for the per-year export steps.
//!
//! The exporter reports through [`ProgressCallback`] so that the CLI can
//! render an `indicatif` bar while library callers and tests stay silent.

/// Receives progress updates from an export run.
///
/// Implementations are shared across concurrently running year tasks, hence
/// `Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Sets the total number of steps.
    fn set_total(&self, total: u64);

    /// Advances by `delta` steps.
    fn inc(&self, delta: u64);

    /// Replaces the status message.
    fn set_message(&self, msg: String);

    /// Marks the run as done.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}
