//! The repair loop and the library entry points.
//!
//! ```text
//! load sample ─▶ [persisted parser?] ─▶ synthesize ─▶ execute ─▶ verify
//!                                           ▲                      │
//!                                           └──── repair ◀─────────┘
//! ```
//!
//! One run is strictly sequential: each attempt's prompt depends on the
//! previous attempt's outcome, and only this module writes the history.

use crate::config::AgentConfig;
use crate::error::{ParseGenError, SynthesisError};
use crate::model::{resolve_model_client, ModelClient};
use crate::output::{
    AttemptHistory, AttemptOutcome, AttemptRecord, LoopState, RunOutcome, RunReport, RunStats,
};
use crate::pipeline::code::{CandidateOrigin, CandidateParser};
use crate::pipeline::sample::{load_sample, SampleDocument, SamplePaths};
use crate::pipeline::sandbox::{CandidateExecutor, ExecutionResult, PythonSandbox};
use crate::pipeline::synthesize::Synthesizer;
use crate::pipeline::verify::verify;
use crate::store::ParserStore;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives generate → execute → verify → repair for one sample.
pub struct RepairLoop {
    synthesizer: Synthesizer,
    executor: Arc<dyn CandidateExecutor>,
    store: ParserStore,
    config: AgentConfig,
}

impl RepairLoop {
    /// Build from config, resolving the model backend and executor.
    pub fn new(config: &AgentConfig) -> Result<Self, ParseGenError> {
        let client = resolve_model_client(config)?;
        Ok(Self::with_parts(client, executor_for(config), config))
    }

    pub fn with_parts(
        client: Arc<dyn ModelClient>,
        executor: Arc<dyn CandidateExecutor>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            synthesizer: Synthesizer::new(client, config),
            executor,
            store: ParserStore::new(config.parsers_dir.clone()),
            config: config.clone(),
        }
    }

    /// Run the loop until a candidate is accepted, the budget runs out, or
    /// `cancel` fires.
    ///
    /// Per-attempt failures never surface as `Err`; they are recorded in
    /// the returned report. `Err` means the run itself broke (e.g. the
    /// accepted parser could not be written).
    pub async fn run(
        &self,
        document: &SampleDocument,
        reference: &Table,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ParseGenError> {
        let run_start = Instant::now();
        let target = document.target.as_str();
        let max_attempts = self.config.max_attempts;
        info!(
            "Generating parser for '{}' with {} (up to {} attempts)",
            target,
            self.synthesizer.client_name(),
            max_attempts
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_start(target, max_attempts);
        }
        self.transition(LoopState::Idle, 0);

        let mut history = AttemptHistory::new(max_attempts);
        let mut persisted = if self.config.reuse_persisted {
            self.store.load(target).await?
        } else {
            None
        };
        if persisted.is_some() {
            info!("Re-checking persisted parser {}", self.store.path_for(target).display());
        }

        let outcome = loop {
            if history.is_full() {
                break RunOutcome::Exhausted;
            }
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }

            let attempt = history.next_attempt();

            if !history.is_empty() {
                self.transition(LoopState::Repairing, attempt);
                if self.config.repair_delay_ms > 0 {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break RunOutcome::Cancelled,
                        _ = sleep(Duration::from_millis(self.config.repair_delay_ms)) => {}
                    }
                }
            }

            let record = self
                .attempt(attempt, persisted.take(), document, reference, &history, cancel)
                .await;
            let accepted = record.outcome.is_accepted();
            let aborted = record.outcome == AttemptOutcome::Aborted;

            info!(
                "Attempt {}/{}: {}",
                attempt,
                max_attempts,
                record.outcome.summary()
            );
            let candidate = record.candidate.clone();
            history.push(record)?;
            if let (Some(cb), Some(last)) = (&self.config.progress_callback, history.last()) {
                cb.on_attempt_complete(last, max_attempts);
            }

            if aborted {
                break RunOutcome::Cancelled;
            }
            if accepted {
                let candidate = candidate.ok_or_else(|| {
                    ParseGenError::Internal("accepted attempt without a candidate".into())
                })?;
                let parser_path = if candidate.origin == CandidateOrigin::Persisted {
                    self.store.path_for(target)
                } else {
                    self.store.save(target, &candidate).await?
                };
                break RunOutcome::Accepted {
                    attempt,
                    parser_path,
                    origin: candidate.origin,
                };
            }
        };

        self.transition(outcome.state(), history.len() as u32);
        let attempts = history.into_records();
        let stats = RunStats::from_records(&attempts, run_start.elapsed().as_millis() as u64);

        match &outcome {
            RunOutcome::Accepted { parser_path, .. } => info!(
                "Accepted after {} attempt(s) in {}ms → {}",
                stats.attempts_used,
                stats.total_duration_ms,
                parser_path.display()
            ),
            RunOutcome::Exhausted => warn!(
                "No parser matched after {} attempt(s)",
                stats.attempts_used
            ),
            RunOutcome::Cancelled => warn!("Cancelled after {} attempt(s)", stats.attempts_used),
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(&outcome, stats.attempts_used);
        }

        Ok(RunReport {
            target: target.to_string(),
            outcome,
            attempts,
            stats,
        })
    }

    /// One attempt: obtain a candidate (persisted or synthesized), run it,
    /// verify it.
    async fn attempt(
        &self,
        attempt: u32,
        persisted: Option<CandidateParser>,
        document: &SampleDocument,
        reference: &Table,
        history: &AttemptHistory,
        cancel: &CancellationToken,
    ) -> AttemptRecord {
        let start = Instant::now();

        let (candidate, input_tokens, output_tokens) = match persisted {
            Some(candidate) => (Ok(candidate), 0, 0),
            None => {
                self.transition(LoopState::Synthesizing, attempt);
                let s = self
                    .synthesizer
                    .synthesize(document, reference, history, cancel)
                    .await;
                (s.result, s.input_tokens, s.output_tokens)
            }
        };

        let (candidate, outcome) = match candidate {
            Err(SynthesisError::Cancelled) => (None, AttemptOutcome::Aborted),
            Err(error) => (None, AttemptOutcome::SynthesisFailed { error }),
            Ok(candidate) => {
                self.transition(LoopState::Executing, attempt);
                let outcome = check_candidate(
                    self.executor.as_ref(),
                    &candidate,
                    document,
                    reference,
                    Duration::from_secs(self.config.sandbox_timeout_secs),
                    cancel,
                    || self.transition(LoopState::Verifying, attempt),
                )
                .await;
                (Some(candidate), outcome)
            }
        };

        AttemptRecord {
            attempt,
            candidate,
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            input_tokens,
            output_tokens,
        }
    }

    fn transition(&self, state: LoopState, attempt: u32) {
        debug!("State → {} (attempt {})", state, attempt);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_state_change(state, attempt);
        }
    }
}

/// Execute a candidate and verify what it produced.
async fn check_candidate(
    executor: &dyn CandidateExecutor,
    candidate: &CandidateParser,
    document: &SampleDocument,
    reference: &Table,
    timeout: Duration,
    cancel: &CancellationToken,
    on_verify: impl FnOnce(),
) -> AttemptOutcome {
    match executor.execute(candidate, document, timeout, cancel).await {
        Err(error) => AttemptOutcome::SandboxFailed { error },
        Ok(ExecutionResult::Aborted) => AttemptOutcome::Aborted,
        Ok(ExecutionResult::Success { table }) => {
            on_verify();
            let diff = verify(&table, reference);
            if diff.is_empty() {
                AttemptOutcome::Accepted {
                    rows: table.row_count(),
                }
            } else {
                AttemptOutcome::Mismatch { diff }
            }
        }
        Ok(result) => AttemptOutcome::ExecutionFailed { result },
    }
}

fn executor_for(config: &AgentConfig) -> Arc<dyn CandidateExecutor> {
    match config.executor {
        Some(ref executor) => Arc::clone(executor),
        None => Arc::new(PythonSandbox::from_config(config)),
    }
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Generate a parser for `target`.
///
/// Loads `{data_dir}/{target}/{target}_sample.{pdf,csv}`, runs the repair
/// loop and, on acceptance, writes `{parsers_dir}/{target}_parser.py`.
///
/// # Returns
/// `Ok(RunReport)` for every completed run, including exhaustion (check
/// `report.outcome`, or call [`RunReport::into_result`]).
///
/// # Errors
/// Only fatal errors: unknown target, unreadable or malformed sample,
/// unconfigured model backend, unwritable parser directory.
pub async fn generate_parser(target: &str, config: &AgentConfig) -> Result<RunReport, ParseGenError> {
    generate_parser_with_cancel(target, config, CancellationToken::new()).await
}

/// [`generate_parser`] with an external cancellation signal.
pub async fn generate_parser_with_cancel(
    target: &str,
    config: &AgentConfig,
    cancel: CancellationToken,
) -> Result<RunReport, ParseGenError> {
    let (document, reference) = load_sample(target, config).await?;
    let agent = RepairLoop::new(config)?;
    agent.run(&document, &reference, &cancel).await
}

/// Synchronous wrapper around [`generate_parser`].
///
/// Creates a temporary tokio runtime internally.
pub fn generate_parser_sync(target: &str, config: &AgentConfig) -> Result<RunReport, ParseGenError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ParseGenError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(generate_parser(target, config))
}

/// What [`inspect`] found for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub target: String,
    pub pdf_path: PathBuf,
    pub csv_path: PathBuf,
    pub pdf_bytes: usize,
    pub page_count: Option<usize>,
    pub text_chars: usize,
    pub text_error: Option<String>,
    pub columns: Vec<String>,
    pub reference_rows: usize,
    /// Path of an existing generated parser, if any.
    pub persisted_parser: Option<PathBuf>,
}

/// Validate a target's sample without calling a model.
///
/// Does not require an API key.
pub async fn inspect(target: &str, config: &AgentConfig) -> Result<SampleSummary, ParseGenError> {
    let paths = SamplePaths::resolve(&config.data_dir, target)?;
    let (document, reference) = load_sample(target, config).await?;
    let store = ParserStore::new(config.parsers_dir.clone());
    let parser_path = store.path_for(&document.target);

    Ok(SampleSummary {
        target: document.target.clone(),
        pdf_path: paths.pdf,
        csv_path: paths.csv,
        pdf_bytes: document.bytes.len(),
        page_count: document.text.page_count,
        text_chars: document.text.pages.iter().map(|p| p.chars().count()).sum(),
        text_error: document.text.error.clone(),
        columns: reference.columns().to_vec(),
        reference_rows: reference.row_count(),
        persisted_parser: parser_path.is_file().then_some(parser_path),
    })
}

/// Result of re-checking a persisted parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revalidation {
    pub target: String,
    pub parser_path: PathBuf,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

impl Revalidation {
    pub fn is_accepted(&self) -> bool {
        self.outcome.is_accepted()
    }
}

/// Re-run the persisted parser for `target` against its sample.
///
/// Read-only: nothing is written, so repeated calls give the same outcome.
/// Does not require an API key.
pub async fn revalidate(target: &str, config: &AgentConfig) -> Result<Revalidation, ParseGenError> {
    revalidate_with_cancel(target, config, CancellationToken::new()).await
}

/// [`revalidate`] with an external cancellation signal.
pub async fn revalidate_with_cancel(
    target: &str,
    config: &AgentConfig,
    cancel: CancellationToken,
) -> Result<Revalidation, ParseGenError> {
    let start = Instant::now();
    let (document, reference) = load_sample(target, config).await?;
    let store = ParserStore::new(config.parsers_dir.clone());
    let parser_path = store.path_for(&document.target);
    let candidate = store
        .load(&document.target)
        .await?
        .ok_or_else(|| ParseGenError::NoPersistedParser {
            target: document.target.clone(),
            path: parser_path.clone(),
        })?;

    let executor = executor_for(config);
    let outcome = check_candidate(
        executor.as_ref(),
        &candidate,
        &document,
        &reference,
        Duration::from_secs(config.sandbox_timeout_secs),
        &cancel,
        || {},
    )
    .await;
    info!("Revalidated {}: {}", parser_path.display(), outcome.summary());

    Ok(Revalidation {
        target: document.target,
        parser_path,
        outcome,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
