//! Sandboxed execution of candidate parsers.
//!
//! Generated code is arbitrary code, so it never runs in this process. Each
//! run gets a fresh temp directory holding the candidate module, a fixed
//! harness script and a copy of the sample PDF, plus a child interpreter
//! started in that directory with:
//!
//! - a cleared environment (`PATH`, `HOME`=tmpdir and the harness knobs only)
//! - null stdin and stdout; stderr drained while the process runs, keeping
//!   only its last few KiB
//! - `RLIMIT_AS` / `RLIMIT_CPU` applied by the harness before the candidate
//!   is imported, and socket connects disabled
//! - a wall-clock timeout and `kill_on_drop`, so a timed-out or cancelled run
//!   is killed as soon as its future is dropped
//!
//! The in-process restrictions are best effort. For real network and
//! filesystem isolation configure a launcher prefix
//! (`AgentConfig::sandbox_launcher`), e.g. `unshare -rn` or
//! `firejail --net=none`.
//!
//! The harness converts whatever `parse()` returns into `{columns, rows}`
//! JSON in a result file; the candidate's own prints are discarded.

use crate::config::AgentConfig;
use crate::error::SandboxError;
use crate::pipeline::code::CandidateParser;
use crate::pipeline::sample::SampleDocument;
use crate::table::Table;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HARNESS_FILE: &str = "harness.py";
const CANDIDATE_FILE: &str = "candidate_parser.py";
const PDF_FILE: &str = "statement.pdf";
const RESULT_FILE: &str = "result.json";

/// Characters of stderr / traceback kept in a failure message.
const FAILURE_TAIL_CHARS: usize = 3000;
/// Worst case of `FAILURE_TAIL_CHARS` in UTF-8.
const STDERR_TAIL_BYTES: usize = FAILURE_TAIL_CHARS * 4;
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of running one candidate against the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// `parse()` returned a table-shaped value.
    Success { table: Table },
    /// The candidate raised, or the process died.
    RuntimeFailure { message: String },
    /// The candidate did not finish within the timeout and was killed.
    TimeoutFailure { after_secs: u64 },
    /// `parse()` returned something that is not a table.
    MalformedOutput { reason: String },
    /// Cancelled while the candidate was running; the process was killed.
    Aborted,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    /// Failure description for the repair prompt. `None` for success.
    pub fn describe_failure(&self) -> Option<String> {
        match self {
            ExecutionResult::Success { .. } => None,
            ExecutionResult::RuntimeFailure { message } => {
                Some(format!("The parser raised an error:\n{message}"))
            }
            ExecutionResult::TimeoutFailure { after_secs } => Some(format!(
                "The parser did not finish within {after_secs}s and was killed. \
                 Look for infinite loops or very slow per-character processing."
            )),
            ExecutionResult::MalformedOutput { reason } => {
                Some(format!("The parser's return value is not a valid table: {reason}"))
            }
            ExecutionResult::Aborted => Some("The run was cancelled.".to_string()),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Success { .. } => "success",
            ExecutionResult::RuntimeFailure { .. } => "runtime failure",
            ExecutionResult::TimeoutFailure { .. } => "timeout",
            ExecutionResult::MalformedOutput { .. } => "malformed output",
            ExecutionResult::Aborted => "aborted",
        }
    }
}

/// Runs candidates in isolation.
///
/// `Err` is reserved for sandbox-setup failures; everything the candidate
/// does wrong is an [`ExecutionResult`].
#[async_trait]
pub trait CandidateExecutor: Send + Sync {
    async fn execute(
        &self,
        candidate: &CandidateParser,
        document: &SampleDocument,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;
}

/// Executes candidates with a child Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    interpreter: String,
    launcher: Vec<String>,
    memory_limit_mb: Option<u64>,
    cpu_limit_secs: Option<u64>,
}

impl PythonSandbox {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            launcher: Vec::new(),
            memory_limit_mb: None,
            cpu_limit_secs: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            launcher: config.sandbox_launcher.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit_secs: config.cpu_limit_secs,
        }
    }

    pub fn with_launcher(mut self, argv: Vec<String>) -> Self {
        self.launcher = argv;
        self
    }

    pub fn with_limits(mut self, memory_limit_mb: Option<u64>, cpu_limit_secs: Option<u64>) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self.cpu_limit_secs = cpu_limit_secs;
        self
    }

    /// `(program, args)` with the optional launcher prefix applied.
    fn argv(&self, entry_point: &str) -> (String, Vec<String>) {
        let mut args: Vec<String> = Vec::new();
        let program = match self.launcher.split_first() {
            Some((first, rest)) => {
                args.extend(rest.iter().cloned());
                args.push(self.interpreter.clone());
                first.clone()
            }
            None => self.interpreter.clone(),
        };
        args.extend(
            ["-B", HARNESS_FILE, CANDIDATE_FILE, PDF_FILE, RESULT_FILE, entry_point]
                .iter()
                .map(|s| s.to_string()),
        );
        (program, args)
    }

    fn command(&self, workdir: &Path, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .env_clear()
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .env("OMP_NUM_THREADS", "1")
            .env("OPENBLAS_NUM_THREADS", "1")
            .env("MKL_NUM_THREADS", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in ["PATH", "SYSTEMROOT"] {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        if let Some(mb) = self.memory_limit_mb {
            cmd.env("PARSEGEN_MEMORY_LIMIT_MB", mb.to_string());
        }
        if let Some(secs) = self.cpu_limit_secs {
            cmd.env("PARSEGEN_CPU_LIMIT_SECS", secs.to_string());
        }
        cmd
    }
}

#[async_trait]
impl CandidateExecutor for PythonSandbox {
    async fn execute(
        &self,
        candidate: &CandidateParser,
        document: &SampleDocument,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let workdir = tempfile::Builder::new()
            .prefix("parsegen-")
            .tempdir()
            .map_err(|e| setup_error("create temp dir", e))?;
        let dir = workdir.path();

        tokio::fs::write(dir.join(HARNESS_FILE), HARNESS_SCRIPT)
            .await
            .map_err(|e| setup_error("write harness", e))?;
        tokio::fs::write(dir.join(CANDIDATE_FILE), &candidate.source)
            .await
            .map_err(|e| setup_error("write candidate", e))?;
        tokio::fs::write(dir.join(PDF_FILE), &document.bytes)
            .await
            .map_err(|e| setup_error("stage sample PDF", e))?;

        let (program, args) = self.argv(&candidate.entry_point);
        debug!("Sandbox: {} {:?} in {}", program, args, dir.display());

        let mut child = self
            .command(dir, &program, &args)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                program: program.clone(),
                detail: e.to_string(),
            })?;

        // Drain stderr concurrently so a chatty candidate never blocks on a
        // full pipe, while holding at most STDERR_TAIL_BYTES of it.
        let stderr_tail = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_tail(pipe, STDERR_TAIL_BYTES)));

        let start = Instant::now();
        // Every early return drops the `Child`, and `kill_on_drop`
        // terminates the process.
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Sandbox: cancelled after {:?}, process killed", start.elapsed());
                abort_reader(stderr_tail);
                return Ok(ExecutionResult::Aborted);
            }
            waited = tokio::time::timeout(timeout, child.wait()) => match waited {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    abort_reader(stderr_tail);
                    return Err(setup_error("wait for sandbox process", e));
                }
                Err(_) => {
                    warn!("Sandbox: timed out after {}s, process killed", timeout.as_secs());
                    abort_reader(stderr_tail);
                    return Ok(ExecutionResult::TimeoutFailure {
                        after_secs: timeout.as_secs(),
                    });
                }
            },
        };

        // A grandchild may still hold the pipe open; don't wait on it forever.
        let stderr = match stderr_tail {
            Some(mut reader) => {
                match tokio::time::timeout(STDERR_DRAIN_GRACE, &mut reader).await {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(_)) => Vec::new(),
                    Err(_) => {
                        reader.abort();
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        debug!(
            "Sandbox: exited ({}) in {:?}, {} bytes of stderr kept",
            describe_status(&status),
            start.elapsed(),
            stderr.len()
        );

        match tokio::fs::read_to_string(dir.join(RESULT_FILE)).await {
            Ok(raw) => Ok(interpret_report(&raw)),
            Err(_) if status.success() => Ok(ExecutionResult::MalformedOutput {
                reason: "the parser process exited without producing a result \
                         (does the module call exit() at import time?)"
                    .to_string(),
            }),
            Err(_) => {
                let stderr = String::from_utf8_lossy(&stderr);
                Ok(ExecutionResult::RuntimeFailure {
                    message: format!(
                        "the parser process died ({}):\n{}",
                        describe_status(&status),
                        tail(&stderr, FAILURE_TAIL_CHARS)
                    ),
                })
            }
        }
    }
}

/// Reads `reader` to EOF, returning only its last `max_bytes` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> Vec<u8> {
    let mut kept = Vec::with_capacity(max_bytes.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > max_bytes.saturating_mul(2) {
                    let excess = kept.len() - max_bytes;
                    kept.drain(..excess);
                }
            }
        }
    }
    if kept.len() > max_bytes {
        let excess = kept.len() - max_bytes;
        kept.drain(..excess);
    }
    kept
}

fn abort_reader(reader: Option<JoinHandle<Vec<u8>>>) {
    if let Some(reader) = reader {
        reader.abort();
    }
}

fn setup_error(step: &str, e: std::io::Error) -> SandboxError {
    SandboxError::Setup {
        detail: format!("{step}: {e}"),
    }
}

/// The JSON document written by the harness.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HarnessReport {
    Ok {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Error {
        error_type: String,
        message: String,
        #[serde(default)]
        traceback: String,
    },
    Malformed {
        reason: String,
    },
}

/// Turn the harness result file into an [`ExecutionResult`], re-checking
/// the table shape on this side of the process boundary.
fn interpret_report(raw: &str) -> ExecutionResult {
    match serde_json::from_str::<HarnessReport>(raw) {
        Ok(HarnessReport::Ok { columns, rows }) => match Table::new(columns, rows) {
            Ok(table) => ExecutionResult::Success { table },
            Err(e) => ExecutionResult::MalformedOutput {
                reason: e.to_string(),
            },
        },
        Ok(HarnessReport::Error {
            error_type,
            message,
            traceback,
        }) => ExecutionResult::RuntimeFailure {
            message: format!(
                "{error_type}: {message}\n\nTraceback (tail):\n{}",
                tail(&traceback, FAILURE_TAIL_CHARS)
            ),
        },
        Ok(HarnessReport::Malformed { reason }) => ExecutionResult::MalformedOutput { reason },
        Err(e) => ExecutionResult::MalformedOutput {
            reason: format!("unreadable sandbox result: {e}"),
        },
    }
}

/// Last `max_chars` characters of `text`, on a char boundary.
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim_end().to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("…{}", skipped.trim_end())
}

fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {sig}");
        }
    }
    "unknown exit status".to_string()
}

/// Harness executed inside the sandbox.
///
/// Arguments: candidate path, PDF path, result path, entry-point name.
pub const HARNESS_SCRIPT: &str = r#"import importlib.util
import json
import os
import socket
import sys
import traceback

_NULL_LIKE = {"nan", "NaN", "None", "<NA>", "NaT"}


def _write(path, payload):
    with open(path, "w", encoding="utf-8") as fh:
        json.dump(payload, fh)


def _apply_limits():
    try:
        import resource
    except ImportError:
        return
    mem = os.environ.get("PARSEGEN_MEMORY_LIMIT_MB")
    if mem:
        limit = int(mem) * 1024 * 1024
        resource.setrlimit(resource.RLIMIT_AS, (limit, limit))
    cpu = os.environ.get("PARSEGEN_CPU_LIMIT_SECS")
    if cpu:
        secs = int(cpu)
        resource.setrlimit(resource.RLIMIT_CPU, (secs, secs))


def _denied(*args, **kwargs):
    raise PermissionError("network access is disabled in the parser sandbox")


class _OfflineSocket(socket.socket):
    connect = _denied
    connect_ex = _denied
    sendto = _denied


def _block_network():
    socket.socket = _OfflineSocket
    socket.create_connection = _denied
    socket.getaddrinfo = _denied


def _cell(value):
    if value is None:
        return ""
    text = str(value).strip()
    return "" if text in _NULL_LIKE else text


def _to_table(result):
    if result is None:
        return None, "parse() returned None, but a pandas DataFrame was expected"
    if hasattr(result, "columns") and hasattr(result, "itertuples"):
        columns = [str(c).strip() for c in result.columns]
        rows = [[_cell(v) for v in row] for row in result.itertuples(index=False, name=None)]
        return {"columns": columns, "rows": rows}, None
    if isinstance(result, (list, tuple)) and all(isinstance(r, dict) for r in result):
        if not result:
            return None, "parse() returned an empty list; return an empty DataFrame with the expected columns instead"
        columns = [str(k).strip() for k in result[0].keys()]
        rows = []
        for i, record in enumerate(result):
            lookup = {str(k).strip(): v for k, v in record.items()}
            if sorted(lookup) != sorted(columns):
                return None, "row %d has keys %r but row 0 has %r" % (i, sorted(lookup), columns)
            rows.append([_cell(lookup[c]) for c in columns])
        return {"columns": columns, "rows": rows}, None
    return None, "parse() returned %s, but a pandas DataFrame was expected" % type(result).__name__


def main():
    candidate_path, pdf_path, result_path, entry = sys.argv[1:5]
    _apply_limits()
    _block_network()
    try:
        spec = importlib.util.spec_from_file_location("candidate_parser", candidate_path)
        module = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(module)
        func = getattr(module, entry, None)
        if not callable(func):
            _write(result_path, {"status": "malformed", "reason": "module defines no callable %s()" % entry})
            return 0
        result = func(pdf_path)
    except BaseException as exc:
        _write(result_path, {
            "status": "error",
            "error_type": type(exc).__name__,
            "message": str(exc),
            "traceback": traceback.format_exc(),
        })
        return 0
    try:
        table, reason = _to_table(result)
    except Exception as exc:
        table, reason = None, "could not convert the result: %s: %s" % (type(exc).__name__, exc)
    if table is None:
        _write(result_path, {"status": "malformed", "reason": reason})
    else:
        _write(result_path, {"status": "ok", "columns": table["columns"], "rows": table["rows"]})
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;
