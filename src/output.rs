//! Result types for a repair-loop run.

use crate::error::{ParseGenError, SandboxError, SynthesisError};
use crate::pipeline::code::{CandidateOrigin, CandidateParser};
use crate::pipeline::sandbox::ExecutionResult;
use crate::pipeline::verify::VerificationDiff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// States of the repair loop.
///
/// ```text
/// Idle → Synthesizing → Executing → Verifying ─┬─▶ Accepted
///             ▲                                 │
///             └────────── Repairing ◀───────────┤ (budget left)
///                                               └─▶ Exhausted
/// any non-terminal state ──(cancel)──▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Synthesizing,
    Executing,
    Verifying,
    Repairing,
    Accepted,
    Exhausted,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Accepted | LoopState::Exhausted | LoopState::Cancelled
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Synthesizing => "synthesizing",
            LoopState::Executing => "executing",
            LoopState::Verifying => "verifying",
            LoopState::Repairing => "repairing",
            LoopState::Accepted => "accepted",
            LoopState::Exhausted => "exhausted",
            LoopState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Produced table equals the reference.
    Accepted { rows: usize },
    /// Ran, but the table differs from the reference.
    Mismatch { diff: VerificationDiff },
    /// Raised, timed out or returned a non-table.
    ExecutionFailed { result: ExecutionResult },
    /// No usable candidate came back from the model.
    SynthesisFailed { error: SynthesisError },
    /// The sandbox could not run the candidate at all.
    SandboxFailed { error: SandboxError },
    /// Cancelled mid-attempt.
    Aborted,
}

/// Cells listed in repair feedback before truncating.
const FEEDBACK_MAX_CELLS: usize = 20;

impl AttemptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AttemptOutcome::Accepted { .. })
    }

    /// Failure description fed into the next repair prompt.
    pub fn feedback(&self) -> Option<String> {
        match self {
            AttemptOutcome::Accepted { .. } => None,
            AttemptOutcome::Mismatch { diff } => Some(format!(
                "The parser ran but its output does not match the expected table.\n{}",
                diff.render(FEEDBACK_MAX_CELLS)
            )),
            AttemptOutcome::ExecutionFailed { result } => result.describe_failure(),
            AttemptOutcome::SynthesisFailed { error } => {
                Some(format!("The previous response was unusable: {error}"))
            }
            AttemptOutcome::SandboxFailed { error } => {
                Some(format!("The parser could not be executed: {error}"))
            }
            AttemptOutcome::Aborted => Some("The attempt was cancelled.".to_string()),
        }
    }

    /// One-line summary for logs and progress output.
    pub fn summary(&self) -> String {
        match self {
            AttemptOutcome::Accepted { rows } => format!("accepted ({rows} rows)"),
            AttemptOutcome::Mismatch { diff } => format!("mismatch: {}", diff.summary()),
            AttemptOutcome::ExecutionFailed { result } => match result {
                ExecutionResult::RuntimeFailure { message } => {
                    let first = message.lines().next().unwrap_or_default();
                    format!("runtime failure: {first}")
                }
                other => other.label().to_string(),
            },
            AttemptOutcome::SynthesisFailed { error } => format!("synthesis failed: {error}"),
            AttemptOutcome::SandboxFailed { error } => format!("sandbox failed: {error}"),
            AttemptOutcome::Aborted => "aborted".to_string(),
        }
    }
}

/// One iteration of the loop. Immutable once pushed into the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed.
    pub attempt: u32,
    /// `None` when synthesis failed before any code was extracted.
    pub candidate: Option<CandidateParser>,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Ordered, append-only attempt history bounded by the attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptHistory {
    max_attempts: u32,
    records: Vec<AttemptRecord>,
}

impl AttemptHistory {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            records: Vec::with_capacity(max_attempts as usize),
        }
    }

    /// Append a record.
    ///
    /// Rejects records past the budget or out of sequence, so the history
    /// can never exceed `max_attempts` entries.
    pub fn push(&mut self, record: AttemptRecord) -> Result<(), ParseGenError> {
        if self.is_full() {
            return Err(ParseGenError::Internal(format!(
                "attempt {} exceeds the budget of {}",
                record.attempt, self.max_attempts
            )));
        }
        if record.attempt != self.next_attempt() {
            return Err(ParseGenError::Internal(format!(
                "attempt {} recorded out of order (expected {})",
                record.attempt,
                self.next_attempt()
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() as u32 >= self.max_attempts
    }

    pub fn next_attempt(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.records.last()
    }

    /// Most recent record that carries a candidate, for the repair prompt.
    pub fn latest_candidate(&self) -> Option<(&CandidateParser, &AttemptOutcome)> {
        self.records
            .iter()
            .rev()
            .find_map(|r| r.candidate.as_ref().map(|c| (c, &r.outcome)))
    }

    pub fn into_records(self) -> Vec<AttemptRecord> {
        self.records
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// A candidate matched and was persisted.
    Accepted {
        attempt: u32,
        parser_path: PathBuf,
        origin: CandidateOrigin,
    },
    /// The budget ran out without a match.
    Exhausted,
    /// Cancelled by the caller.
    Cancelled,
}

impl RunOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RunOutcome::Accepted { .. })
    }

    pub fn state(&self) -> LoopState {
        match self {
            RunOutcome::Accepted { .. } => LoopState::Accepted,
            RunOutcome::Exhausted => LoopState::Exhausted,
            RunOutcome::Cancelled => LoopState::Cancelled,
        }
    }
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub attempts_used: u32,
    pub total_duration_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl RunStats {
    pub fn from_records(records: &[AttemptRecord], total_duration_ms: u64) -> Self {
        Self {
            attempts_used: records.len() as u32,
            total_duration_ms,
            total_input_tokens: records.iter().map(|r| r.input_tokens as u64).sum(),
            total_output_tokens: records.iter().map(|r| r.output_tokens as u64).sum(),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub target: String,
    pub outcome: RunOutcome,
    pub attempts: Vec<AttemptRecord>,
    pub stats: RunStats,
}

impl RunReport {
    pub fn is_accepted(&self) -> bool {
        self.outcome.is_accepted()
    }

    /// The candidate that was accepted, if any.
    pub fn accepted_parser(&self) -> Option<&CandidateParser> {
        match self.outcome {
            RunOutcome::Accepted { attempt, .. } => self
                .attempts
                .iter()
                .find(|r| r.attempt == attempt)
                .and_then(|r| r.candidate.as_ref()),
            _ => None,
        }
    }

    /// Feedback from the last failed attempt.
    pub fn last_failure(&self) -> Option<String> {
        self.attempts
            .iter()
            .rev()
            .find_map(|r| r.outcome.feedback())
    }

    /// Treat anything but acceptance as an error.
    pub fn into_result(self) -> Result<RunReport, ParseGenError> {
        match self.outcome {
            RunOutcome::Accepted { .. } => Ok(self),
            RunOutcome::Exhausted => Err(ParseGenError::Exhausted {
                attempts: self.stats.attempts_used,
                last_failure: self
                    .attempts
                    .last()
                    .map(|r| r.outcome.summary())
                    .unwrap_or_else(|| "no attempts recorded".to_string()),
            }),
            RunOutcome::Cancelled => Err(ParseGenError::Cancelled {
                attempts: self.stats.attempts_used,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::verify::RowCountMismatch;

    fn record(attempt: u32, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            attempt,
            candidate: None,
            outcome,
            duration_ms: 10,
            input_tokens: 100,
            output_tokens: 50,
        }
    }

    fn mismatch() -> AttemptOutcome {
        AttemptOutcome::Mismatch {
            diff: VerificationDiff {
                row_count: Some(RowCountMismatch {
                    expected: 1,
                    actual: 0,
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn history_never_exceeds_budget() {
        let mut h = AttemptHistory::new(2);
        h.push(record(1, mismatch())).unwrap();
        h.push(record(2, mismatch())).unwrap();
        assert!(h.is_full());
        assert!(h.push(record(3, mismatch())).is_err());
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn history_rejects_out_of_order_attempts() {
        let mut h = AttemptHistory::new(3);
        assert!(h.push(record(2, mismatch())).is_err());
        h.push(record(1, mismatch())).unwrap();
        assert!(h.push(record(1, mismatch())).is_err());
    }

    #[test]
    fn latest_candidate_skips_synthesis_failures() {
        let mut h = AttemptHistory::new(3);
        let mut first = record(1, mismatch());
        first.candidate = Some(
            CandidateParser::new("def parse(p):\n    pass\n", CandidateOrigin::Synthesized)
                .unwrap(),
        );
        h.push(first).unwrap();
        h.push(record(
            2,
            AttemptOutcome::SynthesisFailed {
                error: SynthesisError::NoCodeBlock,
            },
        ))
        .unwrap();
        let (cand, outcome) = h.latest_candidate().unwrap();
        assert_eq!(cand.origin, CandidateOrigin::Synthesized);
        assert!(matches!(outcome, AttemptOutcome::Mismatch { .. }));
    }

    #[test]
    fn terminal_states() {
        assert!(LoopState::Accepted.is_terminal());
        assert!(LoopState::Cancelled.is_terminal());
        assert!(!LoopState::Repairing.is_terminal());
        assert_eq!(RunOutcome::Exhausted.state(), LoopState::Exhausted);
    }

    #[test]
    fn mismatch_feedback_mentions_rows() {
        let fb = mismatch().feedback().unwrap();
        assert!(fb.contains("does not match"), "{fb}");
        assert!(AttemptOutcome::Accepted { rows: 3 }.feedback().is_none());
    }

    #[test]
    fn exhausted_report_into_error() {
        let attempts = vec![record(1, mismatch())];
        let report = RunReport {
            target: "icici".into(),
            outcome: RunOutcome::Exhausted,
            stats: RunStats::from_records(&attempts, 5),
            attempts,
        };
        match report.into_result().unwrap_err() {
            ParseGenError::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stats_sum_tokens() {
        let records = vec![record(1, mismatch()), record(2, mismatch())];
        let stats = RunStats::from_records(&records, 42);
        assert_eq!(stats.attempts_used, 2);
        assert_eq!(stats.total_input_tokens, 200);
        assert_eq!(stats.total_output_tokens, 100);
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_string(&AttemptOutcome::Accepted { rows: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"accepted","rows":2}"#);
    }
}
