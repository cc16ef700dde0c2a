//! Synthesis: prompt the model and turn its reply into a candidate.
//!
//! ## Retry Strategy
//!
//! Rate limiting is the only error retried here. It is retried with
//! exponential backoff (`retry_backoff_ms * 2^(n-1)`, capped at
//! `max_backoff_ms`, or the server's `Retry-After` when longer) up to
//! `max_rate_limit_retries` times and never consumes an attempt. Every other
//! failure (transport, auth, timeout, unusable reply) ends the synthesis
//! step and is charged to the attempt budget by the caller.

use crate::config::AgentConfig;
use crate::error::SynthesisError;
use crate::model::{ModelClient, ModelError, Prompt};
use crate::output::{AttemptHistory, AttemptOutcome};
use crate::pipeline::code::{CandidateOrigin, CandidateParser};
use crate::pipeline::sample::SampleDocument;
use crate::prompts::{self, SampleContext, DEFAULT_SYSTEM_PROMPT};
use crate::table::Table;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one synthesis step, with the tokens it cost.
#[derive(Debug)]
pub struct Synthesis {
    pub result: Result<CandidateParser, SynthesisError>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Synthesis {
    fn failed(error: SynthesisError) -> Self {
        Self {
            result: Err(error),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Builds prompts and drives the model client.
pub struct Synthesizer {
    client: Arc<dyn ModelClient>,
    system_prompt: String,
    api_timeout: Duration,
    max_rate_limit_retries: u32,
    retry_backoff_ms: u64,
    max_backoff_ms: u64,
    prompt_text_max_chars: usize,
    preview_rows: usize,
}

impl Synthesizer {
    pub fn new(client: Arc<dyn ModelClient>, config: &AgentConfig) -> Self {
        Self {
            client,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            max_rate_limit_retries: config.max_rate_limit_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            prompt_text_max_chars: config.prompt_text_max_chars,
            preview_rows: config.preview_rows,
        }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Build the prompt for the next attempt.
    ///
    /// A cold prompt when the history holds no candidate yet, otherwise a
    /// repair prompt built from the most recent candidate and its outcome.
    pub fn build_prompt(
        &self,
        document: &SampleDocument,
        reference: &Table,
        history: &AttemptHistory,
    ) -> (Prompt, CandidateOrigin) {
        let text = document.text.joined(self.prompt_text_max_chars);
        let missing = document.text.missing_reason();
        let preview = reference.preview_csv(self.preview_rows);
        let ctx = SampleContext {
            target: &document.target,
            document_text: text.as_deref(),
            text_note: missing.as_deref(),
            page_count: document.text.page_count,
            reference_preview: &preview,
            columns: reference.columns(),
            reference_rows: reference.row_count(),
            images_attached: document.images.len(),
        };

        let last_unusable = match history.last().map(|r| &r.outcome) {
            Some(AttemptOutcome::SynthesisFailed { error }) => Some(error.to_string()),
            _ => None,
        };

        let (mut user, origin) = match history.latest_candidate() {
            Some((candidate, outcome)) => {
                let feedback = outcome
                    .feedback()
                    .unwrap_or_else(|| "The parser failed its test.".to_string());
                let hints = prompts::repair_hints(outcome);
                (
                    prompts::repair_prompt(&ctx, &candidate.source, &feedback, &hints),
                    CandidateOrigin::Repaired,
                )
            }
            None => (prompts::initial_prompt(&ctx), CandidateOrigin::Synthesized),
        };

        if let Some(reason) = last_unusable {
            user = format!("{}{}", prompts::unusable_response_note(&reason), user);
        }

        (
            Prompt {
                system: self.system_prompt.clone(),
                user,
                images: document.images.clone(),
            },
            origin,
        )
    }

    /// Run one synthesis step.
    pub async fn synthesize(
        &self,
        document: &SampleDocument,
        reference: &Table,
        history: &AttemptHistory,
        cancel: &CancellationToken,
    ) -> Synthesis {
        let (prompt, origin) = self.build_prompt(document, reference, history);
        debug!(
            "Prompt: {} chars user, {} image(s), origin {:?}",
            prompt.user.len(),
            prompt.images.len(),
            origin
        );

        let start = Instant::now();
        let mut rate_limited: u32 = 0;

        loop {
            let call = self.client.complete(&prompt);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Synthesis::failed(SynthesisError::Cancelled),
                r = tokio::time::timeout(self.api_timeout, call) => r,
            };

            match outcome {
                Err(_) => {
                    warn!("Model call timed out after {}s", self.api_timeout.as_secs());
                    return Synthesis::failed(SynthesisError::Timeout {
                        secs: self.api_timeout.as_secs(),
                    });
                }
                Ok(Ok(completion)) => {
                    info!(
                        "Model replied in {:?}: {} input tokens, {} output tokens",
                        start.elapsed(),
                        completion.input_tokens,
                        completion.output_tokens
                    );
                    return Synthesis {
                        result: CandidateParser::from_response(&completion.text, origin),
                        input_tokens: completion.input_tokens,
                        output_tokens: completion.output_tokens,
                    };
                }
                Ok(Err(ModelError::RateLimited { retry_after })) => {
                    if rate_limited >= self.max_rate_limit_retries {
                        warn!("Still rate limited after {} retries", rate_limited);
                        return Synthesis::failed(SynthesisError::RateLimited {
                            retries: rate_limited,
                        });
                    }
                    rate_limited += 1;
                    let backoff = self.backoff(rate_limited, retry_after);
                    warn!(
                        "Rate limited: retry {}/{} after {}ms",
                        rate_limited,
                        self.max_rate_limit_retries,
                        backoff.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Synthesis::failed(SynthesisError::Cancelled),
                        _ = sleep(backoff) => {}
                    }
                }
                Ok(Err(ModelError::Failed(detail))) => {
                    warn!("Model call failed: {}", detail);
                    return Synthesis::failed(SynthesisError::Unreachable { detail });
                }
            }
        }
    }

    /// Delay before rate-limit retry `n` (1-indexed).
    fn backoff(&self, n: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self
            .retry_backoff_ms
            .saturating_mul(1u64 << (n.saturating_sub(1)).min(20));
        let ms = retry_after
            .map_or(computed, |d| computed.max(d.as_millis() as u64))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Completion;
    use crate::output::AttemptRecord;
    use crate::pipeline::verify::{RowCountMismatch, VerificationDiff};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GOOD: &str = "```python\ndef parse(pdf_path):\n    return []\n```";

    struct Scripted {
        replies: Mutex<VecDeque<Result<Completion, ModelError>>>,
        prompts: Mutex<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Completion, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn complete(&self, prompt: &Prompt) -> Result<Completion, ModelError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Failed("script exhausted".into())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn text(t: &str) -> Result<Completion, ModelError> {
        Ok(Completion {
            text: t.to_string(),
            input_tokens: 10,
            output_tokens: 5,
        })
    }

    fn limited() -> Result<Completion, ModelError> {
        Err(ModelError::RateLimited { retry_after: None })
    }

    fn synthesizer(client: Arc<Scripted>, retries: u32) -> Synthesizer {
        let config = AgentConfig::builder()
            .max_rate_limit_retries(retries)
            .retry_backoff_ms(1)
            .max_backoff_ms(5)
            .build()
            .unwrap();
        Synthesizer::new(client, &config)
    }

    fn sample() -> (SampleDocument, Table) {
        let doc = SampleDocument::new("icici", "icici_sample.pdf", b"%PDF".to_vec());
        let table = Table::new(
            vec!["Date".into(), "Amount".into()],
            vec![vec!["01-08-2024".into(), "100.00".into()]],
        )
        .unwrap();
        (doc, table)
    }

    #[tokio::test]
    async fn good_reply_becomes_candidate() {
        let client = Scripted::new(vec![text(GOOD)]);
        let s = synthesizer(client.clone(), 3);
        let (doc, table) = sample();
        let out = s
            .synthesize(&doc, &table, &AttemptHistory::new(3), &CancellationToken::new())
            .await;
        let cand = out.result.unwrap();
        assert_eq!(cand.origin, CandidateOrigin::Synthesized);
        assert_eq!((out.input_tokens, out.output_tokens), (10, 5));
    }

    #[tokio::test]
    async fn rate_limits_are_retried() {
        let client = Scripted::new(vec![limited(), limited(), text(GOOD)]);
        let s = synthesizer(client.clone(), 3);
        let (doc, table) = sample();
        let out = s
            .synthesize(&doc, &table, &AttemptHistory::new(3), &CancellationToken::new())
            .await;
        assert!(out.result.is_ok());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn rate_limit_retries_are_capped() {
        let client = Scripted::new(vec![limited(), limited(), limited()]);
        let s = synthesizer(client.clone(), 2);
        let (doc, table) = sample();
        let out = s
            .synthesize(&doc, &table, &AttemptHistory::new(3), &CancellationToken::new())
            .await;
        assert_eq!(out.result.unwrap_err(), SynthesisError::RateLimited { retries: 2 });
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn hard_failure_is_not_retried() {
        let client = Scripted::new(vec![Err(ModelError::Failed("401 invalid key".into())), text(GOOD)]);
        let s = synthesizer(client.clone(), 3);
        let (doc, table) = sample();
        let out = s
            .synthesize(&doc, &table, &AttemptHistory::new(3), &CancellationToken::new())
            .await;
        assert!(matches!(out.result, Err(SynthesisError::Unreachable { .. })));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn prose_reply_is_no_code_block() {
        let client = Scripted::new(vec![text("Sorry, I can't do that.")]);
        let s = synthesizer(client, 3);
        let (doc, table) = sample();
        let out = s
            .synthesize(&doc, &table, &AttemptHistory::new(3), &CancellationToken::new())
            .await;
        assert_eq!(out.result.unwrap_err(), SynthesisError::NoCodeBlock);
    }

    #[tokio::test]
    async fn cancelled_token_stops_synthesis() {
        let client = Scripted::new(vec![text(GOOD)]);
        let s = synthesizer(client, 3);
        let (doc, table) = sample();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = s.synthesize(&doc, &table, &AttemptHistory::new(3), &cancel).await;
        assert_eq!(out.result.unwrap_err(), SynthesisError::Cancelled);
    }

    #[test]
    fn repair_prompt_uses_latest_candidate() {
        let s = synthesizer(Scripted::new(vec![]), 0);
        let (doc, table) = sample();
        let mut history = AttemptHistory::new(3);
        history
            .push(AttemptRecord {
                attempt: 1,
                candidate: Some(
                    CandidateParser::new("def parse(p):\n    return 'v1'\n", CandidateOrigin::Synthesized)
                        .unwrap(),
                ),
                outcome: AttemptOutcome::Mismatch {
                    diff: VerificationDiff {
                        row_count: Some(RowCountMismatch {
                            expected: 1,
                            actual: 0,
                        }),
                        ..Default::default()
                    },
                },
                duration_ms: 0,
                input_tokens: 0,
                output_tokens: 0,
            })
            .unwrap();
        history
            .push(AttemptRecord {
                attempt: 2,
                candidate: None,
                outcome: AttemptOutcome::SynthesisFailed {
                    error: SynthesisError::NoCodeBlock,
                },
                duration_ms: 0,
                input_tokens: 0,
                output_tokens: 0,
            })
            .unwrap();

        let (prompt, origin) = s.build_prompt(&doc, &table, &history);
        assert_eq!(origin, CandidateOrigin::Repaired);
        assert!(prompt.user.contains("return 'v1'"));
        assert!(prompt.user.contains(prompts::HINT_ALL_PAGES));
        assert!(prompt.user.starts_with("Your previous reply could not be used"));
        assert_eq!(prompt.system, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = AgentConfig::builder()
            .retry_backoff_ms(100)
            .max_backoff_ms(350)
            .build()
            .unwrap();
        let s = Synthesizer::new(Scripted::new(vec![]), &config);
        assert_eq!(s.backoff(1, None), Duration::from_millis(100));
        assert_eq!(s.backoff(2, None), Duration::from_millis(200));
        assert_eq!(s.backoff(3, None), Duration::from_millis(350));
        assert_eq!(
            s.backoff(1, Some(Duration::from_secs(10))),
            Duration::from_millis(350)
        );
    }
}
