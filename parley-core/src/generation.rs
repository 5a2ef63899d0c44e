//! Generation client: single-turn prompt-in / completion-out
//!
//! Provides a `GenerationClient` trait with one implementation:
//! - **Gemini**: the `generateContent` REST endpoint of the Gemini API
//!
//! Every call takes a `CancellationToken`; cancellation wins over any
//! in-flight request or retry backoff and surfaces as `GenerationError::Cancelled`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::models::{MessageRole, SamplingDefaults};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ============================================================================
// GenerationClient trait
// ============================================================================

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Produce a completion for `prompt`. Must return promptly with
    /// `GenerationError::Cancelled` once `cancel` fires.
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &Prompt,
        options: &GenerateOptions,
    ) -> Result<Generation, GenerationError>;

    /// Liveness probe: a trivial one-token generation.
    async fn probe(&self, cancel: &CancellationToken) -> Result<(), GenerationError> {
        let prompt = Prompt::new("ping");
        let options = GenerateOptions {
            max_tokens: Some(1),
            ..Default::default()
        };
        self.generate(cancel, &prompt, &options).await.map(|_| ())
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTurn {
    pub role: MessageRole,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub system: Option<String>,
    /// Earlier turns, oldest first.
    pub history: Vec<PromptTurn>,
    pub message: String,
}

impl Prompt {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Per-call options. Unset fields fall back to the client's configured defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i32>,
    pub top_p: Option<f64>,
    pub top_k: Option<i32>,
}

impl GenerateOptions {
    pub fn from_sampling(model: Option<String>, sampling: SamplingDefaults) -> Self {
        Self {
            model,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

// ============================================================================
// Error types
// ============================================================================

/// The three failure kinds callers can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    Cancelled,
    Transport,
    Upstream,
}

impl GenerationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationErrorKind::Cancelled => "cancelled",
            GenerationErrorKind::Transport => "transport",
            GenerationErrorKind::Upstream => "upstream",
        }
    }
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generation cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Empty response from model: {0}")]
    EmptyResponse(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {retries} retries failed: {source}")]
    RetryExhausted {
        retries: usize,
        #[source]
        source: Box<GenerationError>,
    },
}

impl GenerationError {
    pub fn kind(&self) -> GenerationErrorKind {
        match self {
            GenerationError::Cancelled => GenerationErrorKind::Cancelled,
            GenerationError::Http(_) => GenerationErrorKind::Transport,
            GenerationError::Api { .. }
            | GenerationError::EmptyResponse(_)
            | GenerationError::MissingApiKey => GenerationErrorKind::Upstream,
            GenerationError::RetryExhausted { source, .. } => source.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == GenerationErrorKind::Cancelled
    }

    /// Transport failures, rate limits and server errors are worth another try.
    fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Http(_) => true,
            GenerationError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub defaults: SamplingDefaults,
}

impl GeminiConfig {
    /// Returns `None` when no API key is available.
    pub fn from_config(config: &GenerationConfig) -> Option<Self> {
        let api_key = config.resolved_api_key()?;
        Some(Self {
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            defaults: SamplingDefaults {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k.map(|k| k as i32),
                max_tokens: config.max_tokens.map(|m| m as i32),
            },
        })
    }
}

// ============================================================================
// Gemini API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
    #[serde(default)]
    total_token_count: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: Option<GeminiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    code: u16,
    message: String,
}

fn text_part(text: &str) -> Vec<GeminiPart> {
    vec![GeminiPart {
        text: text.to_string(),
    }]
}

// ============================================================================
// GeminiClient
// ============================================================================

/// Gemini generation client: calls the `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        if config.api_key.is_empty() {
            return Err(GenerationError::MissingApiKey);
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self { client, config })
    }

    /// Create a client against a custom base URL (for testing / proxies)
    pub fn with_base_url(mut config: GeminiConfig, base_url: String) -> Result<Self, GenerationError> {
        config.base_url = base_url;
        Self::new(config)
    }

    fn build_request(&self, prompt: &Prompt, options: &GenerateOptions) -> GeminiRequest {
        let defaults = &self.config.defaults;

        let mut contents: Vec<GeminiContent> = prompt
            .history
            .iter()
            .map(|turn| GeminiContent {
                role: Some(
                    match turn.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: text_part(&turn.text),
            })
            .collect();
        contents.push(GeminiContent {
            role: Some("user".to_string()),
            parts: text_part(&prompt.message),
        });

        GeminiRequest {
            contents,
            system_instruction: prompt
                .system
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| GeminiContent {
                    role: None,
                    parts: text_part(s),
                }),
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature.or(defaults.temperature),
                top_p: options.top_p.or(defaults.top_p),
                top_k: options.top_k.or(defaults.top_k),
                max_output_tokens: options.max_tokens.or(defaults.max_tokens),
            },
        }
    }

    /// POST `generateContent`; any non-2xx becomes [`GenerationError::Api`].
    async fn post_generate(
        &self,
        model: &str,
        request: &GeminiRequest,
    ) -> Result<reqwest::Response, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.config.base_url, model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_detail = serde_json::from_str::<GeminiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let (code, message) = error_detail
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::warn!(code = code, message = %message, "Gemini API error");

            return Err(GenerationError::Api { code, message });
        }

        Ok(response)
    }

    async fn generate_once(
        &self,
        model: &str,
        request: &GeminiRequest,
    ) -> Result<Generation, GenerationError> {
        let body: GeminiResponse = self.post_generate(model, request).await?.json().await?;

        if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(GenerationError::EmptyResponse(format!("prompt blocked: {}", reason)));
        }

        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::EmptyResponse("no candidates".to_string()))?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
            return Err(GenerationError::EmptyResponse(format!("finish reason {}", reason)));
        }

        let usage = body.usage_metadata.unwrap_or_default();

        Ok(Generation {
            text,
            model: body.model_version.unwrap_or_else(|| model.to_string()),
            usage: TokenUsage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            },
        })
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &Prompt,
        options: &GenerateOptions,
    ) -> Result<Generation, GenerationError> {
        let model = options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.config.model.clone());
        let request = self.build_request(prompt, options);

        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let attempts = RetryIf::spawn(
            retry_strategy,
            || self.generate_once(&model, &request),
            |e: &GenerationError| e.is_retryable(),
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = attempts => result,
        };

        match result {
            Err(e) if e.is_retryable() && self.config.max_retries > 0 => {
                tracing::error!(
                    retries = self.config.max_retries,
                    error = %e,
                    "All generation retry attempts failed"
                );
                Err(GenerationError::RetryExhausted {
                    retries: self.config.max_retries,
                    source: Box::new(e),
                })
            }
            other => other,
        }
    }

    /// A one-token request; any 2xx counts as reachable, since a
    /// `MAX_TOKENS` finish can legitimately come back with no text.
    async fn probe(&self, cancel: &CancellationToken) -> Result<(), GenerationError> {
        let request = self.build_request(
            &Prompt::new("ping"),
            &GenerateOptions {
                max_tokens: Some(1),
                ..Default::default()
            },
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = self.post_generate(&self.config.model, &request) => result.map(|_| ()),
        }
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

// ============================================================================
// TESTS
// ============================================================================
