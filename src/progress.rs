//! Progress-callback trait for repair-loop events.
//!
//! Inject an [`Arc<dyn RepairProgressCallback>`] via
//! [`crate::config::AgentConfigBuilder::progress_callback`] to observe the
//! state machine as it moves between synthesis, execution and verification.
//!
//! # Example
//!
//! ```rust
//! use edgequake_parsegen::{AgentConfig, AttemptRecord, RepairProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     attempts: AtomicUsize,
//! }
//!
//! impl RepairProgressCallback for CountingCallback {
//!     fn on_attempt_complete(&self, record: &AttemptRecord, max_attempts: u32) {
//!         let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("attempt {}/{} finished ({n} so far)", record.attempt, max_attempts);
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { attempts: AtomicUsize::new(0) });
//! let config = AgentConfig::builder()
//!     .progress_callback(cb as Arc<dyn RepairProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{AttemptRecord, LoopState, RunOutcome};
use std::sync::Arc;

/// Called by the repair loop as it advances.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. A run is sequential, so calls never overlap for one
/// run, but the trait is `Send + Sync` so one callback can serve several runs.
pub trait RepairProgressCallback: Send + Sync {
    /// Called once, after the sample has been loaded.
    fn on_run_start(&self, target: &str, max_attempts: u32) {
        let _ = (target, max_attempts);
    }

    /// Called on every state transition.
    ///
    /// # Arguments
    /// * `attempt`: 1-indexed attempt the state belongs to (0 while `Idle`)
    fn on_state_change(&self, state: LoopState, attempt: u32) {
        let _ = (state, attempt);
    }

    /// Called when an attempt has been recorded in the history.
    fn on_attempt_complete(&self, record: &AttemptRecord, max_attempts: u32) {
        let _ = (record, max_attempts);
    }

    /// Called once with the terminal outcome.
    fn on_run_complete(&self, outcome: &RunOutcome, attempts_used: u32) {
        let _ = (outcome, attempts_used);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RepairProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::AgentConfig`].
pub type ProgressCallback = Arc<dyn RepairProgressCallback>;
