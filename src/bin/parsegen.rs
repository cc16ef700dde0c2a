//! CLI binary for edgequake-parsegen.
//!
//! A thin shim over the library crate that maps CLI flags to `AgentConfig`,
//! wires Ctrl-C to cancellation and prints the outcome.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_parsegen::{
    generate_parser_with_cancel, inspect, revalidate_with_cancel, AgentConfig, AttemptRecord,
    CancellationToken, LoopState, ProgressCallback, RepairProgressCallback, RunOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

/// Exit status when every attempt failed.
const EXIT_EXHAUSTED: u8 = 2;
/// Conventional exit status after SIGINT.
const EXIT_CANCELLED: u8 = 130;

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner for the current state plus one log line per finished attempt.
struct CliProgressCallback {
    bar: ProgressBar,
    max_attempts: AtomicU32,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading sample…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            max_attempts: AtomicU32::new(0),
        })
    }
}

impl RepairProgressCallback for CliProgressCallback {
    fn on_run_start(&self, target: &str, max_attempts: u32) {
        self.max_attempts.store(max_attempts, Ordering::SeqCst);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Generating parser for '{target}' (up to {max_attempts} attempts)…"
            ))
        ));
    }

    fn on_state_change(&self, state: LoopState, attempt: u32) {
        if attempt > 0 {
            let max = self.max_attempts.load(Ordering::SeqCst);
            self.bar.set_prefix(format!("Attempt {attempt}/{max}"));
        }
        let msg = match state {
            LoopState::Idle => "starting",
            LoopState::Synthesizing => "asking the model for a parser…",
            LoopState::Executing => "running the candidate in the sandbox…",
            LoopState::Verifying => "comparing with the reference table…",
            LoopState::Repairing => "preparing a repair prompt…",
            LoopState::Accepted | LoopState::Exhausted | LoopState::Cancelled => return,
        };
        self.bar.set_message(msg);
    }

    fn on_attempt_complete(&self, record: &AttemptRecord, max_attempts: u32) {
        let mark = if record.outcome.is_accepted() {
            green("✓")
        } else {
            red("✗")
        };
        let mut summary = record.outcome.summary();
        if summary.chars().count() > 90 {
            summary = format!("{}…", summary.chars().take(89).collect::<String>());
        }
        self.bar.println(format!(
            "  {} Attempt {}/{}  {}  {}",
            mark,
            record.attempt,
            max_attempts,
            summary,
            dim(&format!("{:.1}s", record.duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_run_complete(&self, _outcome: &RunOutcome, _attempts_used: u32) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Generate a parser from data/icici/icici_sample.{pdf,csv}
  parsegen --target icici

  # More attempts, longer sandbox timeout
  parsegen --target sbi --max-attempts 5 --timeout 120

  # Check a sample pair without calling the model (no API key needed)
  parsegen --target icici --inspect-only

  # Re-run the saved parser against its sample (no API key needed)
  parsegen --target icici --verify-only

  # Run candidates inside a network-less jail
  parsegen --target icici --launcher "firejail --quiet --net=none"

  # Another provider through edgequake-llm
  parsegen --target icici --provider openai --model gpt-4.1

  # Full run report as JSON
  parsegen --target icici --json > report.json

LAYOUT:
  data/<target>/<target>_sample.pdf    sample statement
  data/<target>/<target>_sample.csv    expected table for that statement
  custom_parsers/<target>_parser.py    written when a parser is accepted

EXIT STATUS:
  0    parser accepted (or --verify-only passed)
  1    configuration or input error
  2    no parser matched within the attempt budget
  130  cancelled with Ctrl-C

ENVIRONMENT VARIABLES:
  GOOGLE_API_KEY          Gemini API key (GEMINI_API_KEY also accepted)
  PARSEGEN_*              Every flag has a PARSEGEN_ variable, e.g. PARSEGEN_MAX_ATTEMPTS
  RUST_LOG                Override log filter
"#;

/// Generate and verify bank-statement parsers with an LLM.
#[derive(Parser, Debug)]
#[command(
    name = "parsegen",
    version,
    about = "Generate and verify bank-statement parsers with an LLM",
    long_about = "Generate a Python parser for a family of bank statements. The model writes a \
candidate, the candidate runs in a sandbox against a sample PDF, and its output is compared \
with a reference CSV. Mismatches are fed back to the model until a parser matches or the \
attempt budget runs out.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Target identifier, e.g. icici. Names data/<target>/<target>_sample.{pdf,csv}.
    #[arg(short, long, env = "PARSEGEN_TARGET")]
    target: String,

    /// Directory holding one sub-directory per target.
    #[arg(long, env = "PARSEGEN_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Directory accepted parsers are written to.
    #[arg(long, env = "PARSEGEN_PARSERS_DIR", default_value = "custom_parsers")]
    parsers_dir: PathBuf,

    /// Attempt budget.
    #[arg(long, env = "PARSEGEN_MAX_ATTEMPTS", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..=50))]
    max_attempts: u32,

    /// Wall-clock limit for one candidate run, in seconds.
    #[arg(long, env = "PARSEGEN_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Model ID [default: gemini-2.5-pro for Gemini, gpt-4.1 for other providers].
    #[arg(long, env = "PARSEGEN_MODEL")]
    model: Option<String>,

    /// Provider: gemini (built in), or any edgequake-llm provider (openai, anthropic, ollama, …).
    #[arg(long, env = "PARSEGEN_PROVIDER")]
    provider: Option<String>,

    /// Gemini API key. Falls back to GEMINI_API_KEY when unset or blank.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Python interpreter used to run candidates.
    #[arg(long, env = "PARSEGEN_INTERPRETER", default_value = "python3")]
    interpreter: String,

    /// Command prefix for the sandboxed interpreter, e.g. "firejail --net=none".
    #[arg(long, env = "PARSEGEN_LAUNCHER")]
    launcher: Option<String>,

    /// Address-space limit for candidates, in MiB (0 disables).
    #[arg(long, env = "PARSEGEN_MEMORY_LIMIT_MB", default_value_t = 2048)]
    memory_limit_mb: u64,

    /// CPU-seconds limit for candidates.
    #[arg(long, env = "PARSEGEN_CPU_LIMIT_SECS")]
    cpu_limit_secs: Option<u64>,

    /// Attach images of the first pages to the prompt.
    #[arg(long, env = "PARSEGEN_ATTACH_IMAGES")]
    attach_images: bool,

    /// Ignore an existing parser and start from a cold prompt.
    #[arg(long, env = "PARSEGEN_NO_REUSE")]
    no_reuse: bool,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PARSEGEN_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "PARSEGEN_JSON")]
    json: bool,

    /// Validate the sample pair and exit; no model call.
    #[arg(long, conflicts_with = "verify_only")]
    inspect_only: bool,

    /// Re-run the saved parser against the sample; no model call.
    #[arg(long)]
    verify_only: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "PARSEGEN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PARSEGEN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PARSEGEN_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner already reports progress, so library INFO logs are hidden
    // while it is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let config = build_config(&cli, None).await?;
        let summary = inspect(&cli.target, &config)
            .await
            .context("Failed to inspect sample")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
            );
        } else {
            println!("Target:       {}", summary.target);
            println!("PDF:          {} ({} bytes)", summary.pdf_path.display(), summary.pdf_bytes);
            println!("Reference:    {}", summary.csv_path.display());
            match summary.page_count {
                Some(n) => println!("Pages:        {n}"),
                None => println!("Pages:        unknown"),
            }
            println!("Text chars:   {}", summary.text_chars);
            if let Some(ref e) = summary.text_error {
                println!("Text error:   {e}");
            }
            println!("Columns:      {}", summary.columns.join(", "));
            println!("Rows:         {}", summary.reference_rows);
            match summary.persisted_parser {
                Some(ref p) => println!("Parser:       {}", p.display()),
                None => println!("Parser:       none"),
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    // ── Verify-only mode ─────────────────────────────────────────────────
    if cli.verify_only {
        let config = build_config(&cli, None).await?;
        let result = revalidate_with_cancel(&cli.target, &config, cancel)
            .await
            .context("Verification failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("Failed to serialize result")?
            );
        } else if !cli.quiet {
            let mark = if result.is_accepted() { green("✔") } else { red("✘") };
            eprintln!(
                "{} {}  {}  {}",
                mark,
                bold(&result.parser_path.display().to_string()),
                result.outcome.summary(),
                dim(&format!("{}ms", result.duration_ms)),
            );
            if let Some(feedback) = result.outcome.feedback() {
                eprintln!("{feedback}");
            }
        }
        return Ok(if result.is_accepted() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(EXIT_EXHAUSTED)
        });
    }

    // ── Generate ─────────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new();
        Some(cb as Arc<dyn RepairProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    let report = generate_parser_with_cancel(&cli.target, &config, cancel)
        .await
        .context("Parser generation failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    }

    let code = match &report.outcome {
        RunOutcome::Accepted {
            attempt,
            parser_path,
            ..
        } => {
            if !cli.quiet {
                eprintln!(
                    "{}  parser accepted on attempt {}/{}  →  {}",
                    green("✔"),
                    attempt,
                    config.max_attempts,
                    bold(&parser_path.display().to_string()),
                );
            }
            ExitCode::SUCCESS
        }
        RunOutcome::Exhausted => {
            if !cli.quiet {
                eprintln!(
                    "{}  no parser matched after {} attempts",
                    red("✘"),
                    report.stats.attempts_used
                );
                if let Some(feedback) = report.last_failure() {
                    eprintln!("{}\n{}", bold("Last failure:"), feedback);
                }
            }
            ExitCode::from(EXIT_EXHAUSTED)
        }
        RunOutcome::Cancelled => {
            if !cli.quiet {
                eprintln!(
                    "{}  cancelled after {} attempts",
                    cyan("⚠"),
                    report.stats.attempts_used
                );
            }
            ExitCode::from(EXIT_CANCELLED)
        }
    };

    if !cli.quiet && !cli.json {
        eprintln!(
            "   {} tokens in  /  {} tokens out  /  {}ms total",
            dim(&report.stats.total_input_tokens.to_string()),
            dim(&report.stats.total_output_tokens.to_string()),
            report.stats.total_duration_ms,
        );
    }

    Ok(code)
}

/// Map CLI args to `AgentConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<AgentConfig> {
    let mut builder = AgentConfig::builder()
        .max_attempts(cli.max_attempts)
        .sandbox_timeout_secs(cli.timeout)
        .data_dir(cli.data_dir.clone())
        .parsers_dir(cli.parsers_dir.clone())
        .interpreter(cli.interpreter.clone())
        .memory_limit_mb((cli.memory_limit_mb > 0).then_some(cli.memory_limit_mb))
        .cpu_limit_secs(cli.cpu_limit_secs)
        .attach_page_images(cli.attach_images)
        .reuse_persisted(!cli.no_reuse);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    // The only place credentials are read from the environment.
    if let Some(key) = resolve_api_key(cli.api_key.clone(), || std::env::var("GEMINI_API_KEY").ok()) {
        builder = builder.api_key(key);
    }
    if let Some(ref launcher) = cli.launcher {
        builder = builder.sandbox_launcher(launcher.split_whitespace().map(str::to_string).collect());
    }
    if let Some(ref dir) = cli.pdfium_lib_path {
        builder = builder.pdfium_lib_path(dir.clone());
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// First non-blank key out of the flag (or GOOGLE_API_KEY) and `fallback`.
fn resolve_api_key(
    flag: Option<String>,
    fallback: impl FnOnce() -> Option<String>,
) -> Option<String> {
    let usable = |k: &String| !k.trim().is_empty();
    flag.filter(usable).or_else(|| fallback().filter(usable))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_flag_falls_back_to_gemini_key() {
        let key = resolve_api_key(Some("   ".into()), || Some("gemini-key".into()));
        assert_eq!(key.as_deref(), Some("gemini-key"));
    }

    #[test]
    fn flag_wins_over_fallback() {
        let key = resolve_api_key(Some("flag-key".into()), || Some("gemini-key".into()));
        assert_eq!(key.as_deref(), Some("flag-key"));
    }

    #[test]
    fn blank_everywhere_is_none() {
        assert_eq!(resolve_api_key(Some(String::new()), || Some(" ".into())), None);
        assert_eq!(resolve_api_key(None, || None), None);
    }
}
