//! Error types for the edgequake-parsegen library.
//!
//! Two families of errors reflect the two failure scopes of a run:
//!
//! * [`ParseGenError`] (**fatal**): the run cannot start or cannot finish
//!   cleanly (unknown target, malformed reference CSV, provider not
//!   configured, output not writable). Returned as `Err(ParseGenError)` from
//!   the top-level entry points.
//!
//! * [`SynthesisError`] / [`SandboxError`] (**per-attempt**): one attempt
//!   failed (the model sent no code, the interpreter could not be spawned).
//!   Stored inside [`crate::output::AttemptRecord`] and fed back into the
//!   next prompt; each consumes one unit of the attempt budget.
//!
//! Candidate-side failures (exceptions, timeouts, malformed tables) are not
//! errors at all: they are [`crate::pipeline::sandbox::ExecutionResult`]
//! variants.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-parsegen library.
#[derive(Debug, Error)]
pub enum ParseGenError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The target identifier cannot name files safely.
    #[error("Invalid target '{target}': use letters, digits, '_' or '-' only")]
    InvalidTarget { target: String },

    /// The sample PDF or the reference CSV is missing.
    #[error(
        "No sample found for target '{target}'.\nExpected both files to exist:\n  - {}\n  - {}",
        pdf.display(),
        csv.display()
    )]
    TargetNotFound {
        target: String,
        pdf: PathBuf,
        csv: PathBuf,
    },

    /// Process does not have read permission on a sample file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The sample file exists but is not a PDF.
    #[error("Sample is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The reference CSV is empty or not table-shaped.
    #[error("Reference table '{path}' is malformed: {detail}")]
    MalformedReference { path: PathBuf, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// No model backend could be built (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Outcome errors ────────────────────────────────────────────────────
    /// Every attempt failed to produce a matching table.
    ///
    /// Returned by [`crate::output::RunReport::into_result`] when the
    /// caller wants exhaustion as an error instead of a reported outcome.
    #[error("No parser matched the reference after {attempts} attempts.\nLast failure: {last_failure}")]
    Exhausted { attempts: u32, last_failure: String },

    /// The run was cancelled before a parser was accepted.
    #[error("Run cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// A persisted parser was requested but none exists.
    #[error("No persisted parser for target '{target}' at '{}'", path.display())]
    NoPersistedParser { target: String, path: PathBuf },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write the accepted parser.
    #[error("Failed to write parser file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed synthesis step. Retryable and attempt-consuming.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SynthesisError {
    /// Transport or API failure talking to the model.
    #[error("Model endpoint unreachable: {detail}")]
    Unreachable { detail: String },

    /// The completion call exceeded `api_timeout_secs`.
    #[error("Model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Still rate limited after the capped number of backoff retries.
    #[error("Still rate limited after {retries} backoff retries")]
    RateLimited { retries: u32 },

    /// The response contained no usable code.
    #[error("Model response contained no extractable code block")]
    NoCodeBlock,

    /// The code does not define the required entry point.
    #[error("Generated code does not define a top-level `def {entry_point}(...)`")]
    MissingEntryPoint { entry_point: String },

    /// Cancelled while waiting on the model or a backoff sleep.
    #[error("Synthesis cancelled")]
    Cancelled,
}

/// The sandbox itself could not be prepared or started.
///
/// Distinct from a candidate failing inside the sandbox, which is an
/// [`crate::pipeline::sandbox::ExecutionResult`].
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SandboxError {
    /// Temp dir or file staging failed.
    #[error("Sandbox setup failed: {detail}")]
    Setup { detail: String },

    /// The interpreter (or launcher) could not be spawned.
    #[error("Failed to spawn '{program}': {detail}\nIs it installed and on PATH?")]
    Spawn { program: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_not_found_lists_both_paths() {
        let e = ParseGenError::TargetNotFound {
            target: "icici".into(),
            pdf: PathBuf::from("data/icici/icici_sample.pdf"),
            csv: PathBuf::from("data/icici/icici_sample.csv"),
        };
        let msg = e.to_string();
        assert!(msg.contains("icici_sample.pdf"), "got: {msg}");
        assert!(msg.contains("icici_sample.csv"), "got: {msg}");
    }

    #[test]
    fn exhausted_display() {
        let e = ParseGenError::Exhausted {
            attempts: 3,
            last_failure: "row count mismatch".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("3 attempts"), "got: {msg}");
        assert!(msg.contains("row count mismatch"));
    }

    #[test]
    fn missing_entry_point_display() {
        let e = SynthesisError::MissingEntryPoint {
            entry_point: "parse".into(),
        };
        assert!(e.to_string().contains("def parse"));
    }

    #[test]
    fn spawn_error_display() {
        let e = SandboxError::Spawn {
            program: "python3".into(),
            detail: "No such file or directory".into(),
        };
        assert!(e.to_string().contains("python3"));
    }
}
