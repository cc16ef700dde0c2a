//! Configuration for a parser-synthesis run.
//!
//! Every knob of the repair loop lives in [`AgentConfig`], built via its
//! [`AgentConfigBuilder`]. Credentials are plain config values: the library
//! never looks them up in the environment (the CLI does that once at startup).

use crate::error::ParseGenError;
use crate::model::ModelClient;
use crate::pipeline::sandbox::CandidateExecutor;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default model used with the Gemini backend.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";

/// Configuration for one generate → execute → verify → repair run.
///
/// Built via [`AgentConfig::builder()`] or [`AgentConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_parsegen::AgentConfig;
///
/// let config = AgentConfig::builder()
///     .max_attempts(5)
///     .sandbox_timeout_secs(30)
///     .api_key("test-key")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_attempts, 5);
/// ```
#[derive(Clone)]
pub struct AgentConfig {
    /// Attempt budget: synthesis → execution → verification cycles. Default: 3.
    pub max_attempts: u32,

    /// Wall-clock limit for one candidate run in the sandbox. Default: 60.
    pub sandbox_timeout_secs: u64,

    /// Model identifier. If None, the backend default is used
    /// (`gemini-2.5-pro` for Gemini).
    pub model: Option<String>,

    /// Provider name. `None` or `"gemini"` selects the built-in Gemini
    /// client; any other name is resolved through `edgequake_llm`.
    pub provider_name: Option<String>,

    /// API key for the Gemini backend. Required unless `model_client` or a
    /// non-Gemini `provider_name` is set.
    pub api_key: Option<String>,

    /// Pre-constructed model client. Takes precedence over everything else.
    pub model_client: Option<Arc<dyn ModelClient>>,

    /// Pre-constructed executor. If None, a [`crate::PythonSandbox`] is
    /// built from the sandbox fields below.
    pub executor: Option<Arc<dyn CandidateExecutor>>,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Maximum output tokens per completion. Default: 8192.
    pub max_tokens: usize,

    /// Backoff retries on a rate-limit signal inside one attempt. Default: 5.
    ///
    /// These retries never consume the attempt budget.
    pub max_rate_limit_retries: u32,

    /// Initial backoff delay in milliseconds; doubles per retry. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff sleep. Default: 30000.
    pub max_backoff_ms: u64,

    /// Per-completion timeout in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Pause before each repair prompt. Default: 2000.
    pub repair_delay_ms: u64,

    /// Root of the sample layout `{data_dir}/{target}/{target}_sample.{pdf,csv}`.
    /// Default: `data`.
    pub data_dir: PathBuf,

    /// Where accepted parsers are written. Default: `custom_parsers`.
    pub parsers_dir: PathBuf,

    /// Python interpreter used by the sandbox. Default: `python3`.
    pub interpreter: String,

    /// Optional launcher prefix for OS-level isolation,
    /// e.g. `["unshare", "-rn"]` or `["firejail", "--net=none", "--quiet"]`.
    pub sandbox_launcher: Vec<String>,

    /// Address-space limit for the candidate process. Default: 2048 MiB.
    pub memory_limit_mb: Option<u64>,

    /// CPU-seconds limit for the candidate process. Default: none
    /// (the wall-clock timeout still applies).
    pub cpu_limit_secs: Option<u64>,

    /// Pages of extracted text embedded in the cold prompt. Default: 2.
    pub prompt_text_pages: usize,

    /// Character cap for the embedded PDF text. Default: 12000.
    pub prompt_text_max_chars: usize,

    /// Reference rows shown in the schema preview. Default: 5.
    pub preview_rows: usize,

    /// Attach rendered images of the first pages to the cold prompt. Default: false.
    pub attach_page_images: bool,

    /// Longest edge of an attached page image in pixels. Default: 1600.
    pub image_max_pixels: u32,

    /// Try the persisted parser for the target before synthesising. Default: true.
    pub reuse_persisted: bool,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Directory holding libpdfium. If None, the working directory and then
    /// the system library path are tried.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            sandbox_timeout_secs: 60,
            model: None,
            provider_name: None,
            api_key: None,
            model_client: None,
            executor: None,
            temperature: 0.2,
            max_tokens: 8192,
            max_rate_limit_retries: 5,
            retry_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            api_timeout_secs: 180,
            repair_delay_ms: 2000,
            data_dir: PathBuf::from("data"),
            parsers_dir: PathBuf::from("custom_parsers"),
            interpreter: "python3".to_string(),
            sandbox_launcher: Vec::new(),
            memory_limit_mb: Some(2048),
            cpu_limit_secs: None,
            prompt_text_pages: 2,
            prompt_text_max_chars: 12_000,
            preview_rows: 5,
            attach_page_images: false,
            image_max_pixels: 1600,
            reuse_persisted: true,
            system_prompt: None,
            pdfium_lib_path: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("max_attempts", &self.max_attempts)
            .field("sandbox_timeout_secs", &self.sandbox_timeout_secs)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model_client", &self.model_client.as_ref().map(|_| "<dyn ModelClient>"))
            .field("executor", &self.executor.as_ref().map(|_| "<dyn CandidateExecutor>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_rate_limit_retries", &self.max_rate_limit_retries)
            .field("data_dir", &self.data_dir)
            .field("parsers_dir", &self.parsers_dir)
            .field("interpreter", &self.interpreter)
            .field("sandbox_launcher", &self.sandbox_launcher)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("cpu_limit_secs", &self.cpu_limit_secs)
            .field("attach_page_images", &self.attach_page_images)
            .field("reuse_persisted", &self.reuse_persisted)
            .finish()
    }
}

impl AgentConfig {
    /// Create a new builder for `AgentConfig`.
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model id to send, falling back to the Gemini default.
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL)
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn sandbox_timeout_secs(mut self, secs: u64) -> Self {
        self.config.sandbox_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.config.model_client = Some(client);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CandidateExecutor>) -> Self {
        self.config.executor = Some(executor);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_rate_limit_retries(mut self, n: u32) -> Self {
        self.config.max_rate_limit_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn repair_delay_ms(mut self, ms: u64) -> Self {
        self.config.repair_delay_ms = ms;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn parsers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.parsers_dir = dir.into();
        self
    }

    pub fn interpreter(mut self, program: impl Into<String>) -> Self {
        self.config.interpreter = program.into();
        self
    }

    pub fn sandbox_launcher(mut self, argv: Vec<String>) -> Self {
        self.config.sandbox_launcher = argv;
        self
    }

    pub fn memory_limit_mb(mut self, mb: Option<u64>) -> Self {
        self.config.memory_limit_mb = mb;
        self
    }

    pub fn cpu_limit_secs(mut self, secs: Option<u64>) -> Self {
        self.config.cpu_limit_secs = secs;
        self
    }

    pub fn prompt_text_pages(mut self, n: usize) -> Self {
        self.config.prompt_text_pages = n.max(1);
        self
    }

    pub fn prompt_text_max_chars(mut self, n: usize) -> Self {
        self.config.prompt_text_max_chars = n;
        self
    }

    pub fn preview_rows(mut self, n: usize) -> Self {
        self.config.preview_rows = n;
        self
    }

    pub fn attach_page_images(mut self, v: bool) -> Self {
        self.config.attach_page_images = v;
        self
    }

    pub fn image_max_pixels(mut self, px: u32) -> Self {
        self.config.image_max_pixels = px.max(100);
        self
    }

    pub fn reuse_persisted(mut self, v: bool) -> Self {
        self.config.reuse_persisted = v;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn pdfium_lib_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AgentConfig, ParseGenError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(ParseGenError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.sandbox_timeout_secs == 0 {
            return Err(ParseGenError::InvalidConfig(
                "sandbox timeout must be ≥ 1 second".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(ParseGenError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.interpreter.trim().is_empty() {
            return Err(ParseGenError::InvalidConfig(
                "interpreter must not be empty".into(),
            ));
        }
        if c.memory_limit_mb == Some(0) || c.cpu_limit_secs == Some(0) {
            return Err(ParseGenError::InvalidConfig(
                "resource limits must be ≥ 1 when set".into(),
            ));
        }
        Ok(self.config)
    }
}
