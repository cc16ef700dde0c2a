//! # edgequake-parsegen
//!
//! Generate bank-statement parsers with an LLM, then prove them against a
//! sample before keeping them.
//!
//! ## How it works
//!
//! Given a target `icici`, the crate reads a sample statement
//! (`data/icici/icici_sample.pdf`) and the table it should produce
//! (`data/icici/icici_sample.csv`), asks the model for a Python module with a
//! `parse(pdf_path)` function, runs that module in a sandboxed child
//! interpreter, and compares its output cell by cell with the reference. On
//! a mismatch the diff and the failing code go back to the model. The first
//! candidate that matches is written to `custom_parsers/icici_parser.py`.
//!
//! ```text
//! sample ─▶ synthesize ─▶ execute (sandbox) ─▶ verify ─┬─▶ Accepted → persist
//!               ▲                                       │
//!               └─────────── repair (diff + code) ◀─────┴─▶ Exhausted
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_parsegen::{generate_parser, AgentConfig, RunOutcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::builder()
//!         .api_key(std::env::var("GOOGLE_API_KEY")?)
//!         .build()?;
//!     let report = generate_parser("icici", &config).await?;
//!     match &report.outcome {
//!         RunOutcome::Accepted { parser_path, .. } => println!("{}", parser_path.display()),
//!         other => eprintln!("{other:?}: {:?}", report.last_failure()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `parsegen` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Safety
//!
//! Generated code is untrusted. It only ever runs in a child process with a
//! cleared environment, a private temp directory, resource limits and a
//! timeout. For hard network/filesystem isolation set
//! [`AgentConfig::sandbox_launcher`] to a jail such as `firejail --net=none`.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod agent;
pub mod config;
pub mod error;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;
pub mod table;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use agent::{
    generate_parser, generate_parser_sync, generate_parser_with_cancel, inspect, revalidate,
    revalidate_with_cancel, RepairLoop, Revalidation, SampleSummary,
};
pub use config::{AgentConfig, AgentConfigBuilder, DEFAULT_GEMINI_MODEL};
pub use error::{ParseGenError, SandboxError, SynthesisError};
pub use model::{Completion, GeminiClient, LlmProviderClient, ModelClient, ModelError, PageImage, Prompt};
pub use output::{
    AttemptHistory, AttemptOutcome, AttemptRecord, LoopState, RunOutcome, RunReport, RunStats,
};
pub use pipeline::code::{CandidateOrigin, CandidateParser, ENTRY_POINT};
pub use pipeline::sample::SampleDocument;
pub use pipeline::sandbox::{CandidateExecutor, ExecutionResult, PythonSandbox};
pub use pipeline::verify::{verify, VerificationDiff};
pub use progress::{NoopProgressCallback, ProgressCallback, RepairProgressCallback};
pub use store::ParserStore;
pub use table::Table;
pub use tokio_util::sync::CancellationToken;
