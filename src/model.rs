//! Model backends.
//!
//! The repair loop only needs "prompt in, text out", expressed by
//! [`ModelClient`]. Two implementations ship with the crate:
//!
//! - [`GeminiClient`]: direct `generateContent` REST calls, the default
//!   backend, authenticated with `AgentConfig::api_key` (never read from the
//!   environment here)
//! - [`LlmProviderClient`]: any `edgequake_llm` provider (OpenAI, Anthropic,
//!   Ollama, …) selected with `provider_name`
//!
//! Tests and embedders can pass their own client through
//! [`crate::config::AgentConfigBuilder::model_client`].

use crate::config::AgentConfig;
use crate::error::ParseGenError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model used with a named non-Gemini provider when none is given.
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4.1";

/// A rendered page attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub mime_type: String,
    /// Base64 (standard alphabet) image bytes.
    pub data_b64: String,
}

impl PageImage {
    /// Encode a rendered page as PNG; lossy formats blur small print.
    pub fn png(img: &DynamicImage) -> Result<Self, image::ImageError> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(Self {
            mime_type: "image/png".to_string(),
            data_b64: STANDARD.encode(&buf),
        })
    }
}

/// One request to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub images: Vec<PageImage>,
}

/// A model reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// HTTP 429 / 503 or the provider's equivalent. Retried with backoff.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Anything else: auth, bad request, transport.
    #[error("{0}")]
    Failed(String),
}

/// Prompt in, text out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ModelError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

// ── Gemini ───────────────────────────────────────────────────────────────

/// `generateContent` client for Google's Gemini API.
#[derive(Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: usize,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ParseGenError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ParseGenError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            temperature: 0.2,
            max_output_tokens: 8192,
        })
    }

    /// Point at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_generation(mut self, temperature: f32, max_output_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn request_body(&self, prompt: &Prompt) -> GenerateContentRequest {
        let mut parts = vec![Part::text(&prompt.user)];
        parts.extend(prompt.images.iter().map(|img| Part {
            text: None,
            inline_data: Some(InlineData {
                mime_type: img.mime_type.clone(),
                data: img.data_b64.clone(),
            }),
        }));

        GenerateContentRequest {
            system_instruction: (!prompt.system.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part::text(&prompt.system)],
            }),
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ModelError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| ModelError::Failed(format!("request failed: {}", e.without_url())))?;

        let status = res.status();
        if status.as_u16() == 429 || status.as_u16() == 503 {
            let retry_after = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ModelError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ModelError::Failed(format!(
                "Gemini API error (status {status}): {}",
                truncate(&body, 500)
            )));
        }

        let body: GenerateContentResponse = res
            .json()
            .await
            .map_err(|e| ModelError::Failed(format!("unreadable Gemini response: {e}")))?;
        body.into_completion()
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(s: &str) -> Self {
        Self {
            text: Some(s.to_string()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GenerateContentResponse {
    fn into_completion(self) -> Result<Completion, ModelError> {
        let usage = self.usage_metadata;
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Failed("Gemini returned no candidates".to_string()))?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ModelError::Failed(format!(
                "Gemini returned no text (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        Ok(Completion {
            text,
            input_tokens: usage.as_ref().map_or(0, |u| u.prompt_token_count),
            output_tokens: usage.as_ref().map_or(0, |u| u.candidates_token_count),
        })
    }
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// Adapts any `edgequake_llm` provider.
pub struct LlmProviderClient {
    provider: Arc<dyn LLMProvider>,
    name: String,
    options: CompletionOptions,
}

impl LlmProviderClient {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>, config: &AgentConfig) -> Self {
        Self {
            provider,
            name: name.into(),
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl ModelClient for LlmProviderClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ModelError> {
        let mut messages = Vec::with_capacity(2);
        if !prompt.system.is_empty() {
            messages.push(ChatMessage::system(&prompt.system));
        }
        if prompt.images.is_empty() {
            messages.push(ChatMessage::user(&prompt.user));
        } else {
            let images = prompt
                .images
                .iter()
                .map(|img| ImageData::new(img.data_b64.clone(), img.mime_type.clone()).with_detail("high"))
                .collect();
            messages.push(ChatMessage::user_with_images(&prompt.user, images));
        }

        match self.provider.chat(&messages, Some(&self.options)).await {
            Ok(response) => Ok(Completion {
                text: response.content,
                input_tokens: response.prompt_tokens as u32,
                output_tokens: response.completion_tokens as u32,
            }),
            Err(e) => Err(classify_provider_error(&e.to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Provider errors arrive as opaque strings; pick out rate limiting.
fn classify_provider_error(message: &str) -> ModelError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
    {
        ModelError::RateLimited { retry_after: None }
    } else {
        ModelError::Failed(message.to_string())
    }
}

// ── Resolution ───────────────────────────────────────────────────────────

/// Pick the model backend, most specific first:
///
/// 1. a prebuilt `config.model_client`
/// 2. a named non-Gemini provider through `ProviderFactory`
/// 3. Gemini with `config.api_key`
pub fn resolve_model_client(config: &AgentConfig) -> Result<Arc<dyn ModelClient>, ParseGenError> {
    if let Some(ref client) = config.model_client {
        return Ok(Arc::clone(client));
    }

    if let Some(name) = config.provider_name.as_deref() {
        if !name.eq_ignore_ascii_case("gemini") {
            let model = config.model.as_deref().unwrap_or(DEFAULT_PROVIDER_MODEL);
            let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
                ParseGenError::ProviderNotConfigured {
                    provider: name.to_string(),
                    hint: format!("{e}"),
                }
            })?;
            debug!("Using edgequake-llm provider {} / {}", name, model);
            return Ok(Arc::new(LlmProviderClient::new(
                provider,
                format!("{name}/{model}"),
                config,
            )));
        }
    }

    let model = config.model_or_default().to_string();
    let key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ParseGenError::ProviderNotConfigured {
            provider: "gemini".to_string(),
            hint: "No API key configured. Set AgentConfig::api_key \
                   (the CLI reads GOOGLE_API_KEY or GEMINI_API_KEY)."
                .to_string(),
        })?;

    debug!("Using Gemini model {}", model);
    let client = GeminiClient::new(key, model, Duration::from_secs(config.api_timeout_secs))?
        .with_generation(config.temperature, config.max_tokens);
    Ok(Arc::new(client))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ModelClient for Echo {
        async fn complete(&self, prompt: &Prompt) -> Result<Completion, ModelError> {
            Ok(Completion {
                text: prompt.user.clone(),
                ..Default::default()
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "sys".into(),
            user: "hello".into(),
            images: vec![PageImage {
                mime_type: "image/png".into(),
                data_b64: "AAAA".into(),
            }],
        }
    }

    #[test]
    fn page_image_is_base64_png() {
        use image::{Rgba, RgbaImage};
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255])));
        let page = PageImage::png(&img).unwrap();
        assert_eq!(page.mime_type, "image/png");
        let bytes = STANDARD.decode(&page.data_b64).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn request_body_uses_gemini_field_names() {
        let client = GeminiClient::new("k", "gemini-2.5-pro", Duration::from_secs(5)).unwrap();
        let json = serde_json::to_value(client.request_body(&prompt())).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 8192);
    }

    #[test]
    fn response_text_parts_are_joined() {
        let raw = r#"{
            "candidates": [{"content": {"role": "model", "parts": [{"text": "a"}, {"text": "b"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        }"#;
        let resp: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        let c = resp.into_completion().unwrap();
        assert_eq!(c.text, "ab");
        assert_eq!((c.input_tokens, c.output_tokens), (12, 3));
    }

    #[test]
    fn blocked_response_is_failure() {
        let raw = r#"{"candidates": [{"finishReason": "SAFETY"}]}"#;
        let resp: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        match resp.into_completion().unwrap_err() {
            ModelError::Failed(msg) => assert!(msg.contains("SAFETY"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_limit_strings_are_classified() {
        assert!(matches!(
            classify_provider_error("HTTP 429 Too Many Requests"),
            ModelError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_provider_error("invalid api key"),
            ModelError::Failed(_)
        ));
    }

    #[test]
    fn missing_key_is_not_configured() {
        let config = AgentConfig::default();
        match resolve_model_client(&config) {
            Err(ParseGenError::ProviderNotConfigured { provider, .. }) => {
                assert_eq!(provider, "gemini")
            }
            Err(e) => panic!("unexpected error {e:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn blank_key_is_not_configured() {
        let config = AgentConfig::builder().api_key("   ").build().unwrap();
        assert!(resolve_model_client(&config).is_err());
    }

    #[test]
    fn prebuilt_client_wins() {
        let config = AgentConfig::builder()
            .model_client(Arc::new(Echo))
            .build()
            .unwrap();
        let client = resolve_model_client(&config).unwrap();
        assert_eq!(client.name(), "echo");
    }

    #[test]
    fn explicit_key_builds_gemini_client() {
        let config = AgentConfig::builder().api_key("test-key").build().unwrap();
        let client = resolve_model_client(&config).unwrap();
        assert_eq!(client.name(), "gemini-2.5-pro");
    }
}
