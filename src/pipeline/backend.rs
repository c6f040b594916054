//! Vision backends: "given an image and a prompt, return text".
//!
//! The [`VisionBackend`] trait is the single seam between the extraction
//! core and whatever model serves the vision capability. Three backends
//! ship with the crate:
//!
//! * [`OpenAiVisionBackend`]: direct `chat/completions` call against any
//!   OpenAI-compatible endpoint using caller-supplied [`Credentials`].
//! * [`LlmProviderBackend`]: wraps any `edgequake_llm::LLMProvider`
//!   (OpenAI, Anthropic, Gemini, Ollama, ...).
//! * [`MockVisionBackend`]: fixed demo form, only reachable through the
//!   explicit `mock_mode` switch.
//!
//! Backends classify failures into [`VisionCallError::Transient`] and
//! [`VisionCallError::Rejected`]; retry policy and timeouts live in
//! [`crate::pipeline::llm::VisionClient`], not here.

use crate::config::Credentials;
use crate::error::{TranscribeError, VisionCallError};
use crate::pipeline::encode::EncodedPage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One vision call.
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub image: &'a EncodedPage,
    pub system_prompt: &'a str,
    pub instruction: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// The vision capability consumed by the extraction client.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Model identifier recorded on the job.
    fn model_name(&self) -> &str;

    /// Send one page image and return the model's raw text.
    async fn call(&self, request: VisionRequest<'_>) -> Result<String, VisionCallError>;

    /// Cheap credential check run once per job before any page.
    ///
    /// Only [`VisionCallError::Rejected`] counts as a failed pre-flight; a
    /// transient failure lets the job proceed.
    async fn validate(&self) -> Result<(), VisionCallError> {
        Ok(())
    }
}

// ── OpenAI-compatible HTTP backend ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Direct OpenAI `chat/completions` client.
pub struct OpenAiVisionBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    credentials: Credentials,
}

impl std::fmt::Debug for OpenAiVisionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiVisionBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl OpenAiVisionBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranscribeError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            credentials,
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.credentials.api_key())
    }
}

/// Network-level failures never carry a verdict on the request itself.
fn transport_error(e: reqwest::Error) -> VisionCallError {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "network error"
    };
    VisionCallError::Transient {
        detail: format!("{kind}: {e}"),
    }
}

#[async_trait]
impl VisionBackend for OpenAiVisionBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: VisionRequest<'_>) -> Result<String, VisionCallError> {
        let body = json!({
            "model": self.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": [
                    {"type": "text", "text": request.instruction},
                    {"type": "image_url", "image_url": {
                        "url": request.image.data_uri(),
                        "detail": "high",
                    }},
                ]},
            ],
        });
        let body = serde_json::to_vec(&body).map_err(|e| VisionCallError::Rejected {
            status: None,
            detail: format!("request body: {e}"),
        })?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(VisionCallError::from_status(status.as_u16(), text));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| VisionCallError::Rejected {
                status: Some(status.as_u16()),
                detail: format!("malformed completion envelope: {e}"),
            })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!("Page {}: {} chars from {}", request.image.page_number, content.len(), self.model);
        Ok(content)
    }

    async fn validate(&self) -> Result<(), VisionCallError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(VisionCallError::from_status(status.as_u16(), text))
    }
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// Serves the vision capability through any `edgequake_llm` provider.
pub struct LlmProviderBackend {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl LlmProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Build a provider by name through [`ProviderFactory`], which reads the
    /// provider's API key from its usual environment variable.
    pub fn from_provider_name(provider_name: &str, model: &str) -> Result<Self, TranscribeError> {
        let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
            TranscribeError::ProviderNotConfigured {
                provider: provider_name.to_string(),
                hint: format!("{e}"),
            }
        })?;
        Ok(Self::new(provider, model))
    }
}

/// Status codes and phrases that mark a provider error as final.
static RE_REJECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:400|401|403)\b|unauthorized|forbidden|invalid api key|authentication")
        .unwrap()
});

/// The provider error type is opaque; classify by its message.
fn classify_provider_error(message: String) -> VisionCallError {
    if RE_REJECTED.is_match(&message) {
        VisionCallError::Rejected {
            status: None,
            detail: message,
        }
    } else {
        VisionCallError::Transient { detail: message }
    }
}

#[async_trait]
impl VisionBackend for LlmProviderBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: VisionRequest<'_>) -> Result<String, VisionCallError> {
        let messages = vec![
            ChatMessage::system(request.system_prompt),
            ChatMessage::user_with_images(
                request.instruction.as_str(),
                vec![request.image.to_image_data()],
            ),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(format!("{e}")))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens",
            request.image.page_number, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

// ── Demo backend ─────────────────────────────────────────────────────────

/// Returns the same demo form for every page.
#[derive(Debug, Clone, Default)]
pub struct MockVisionBackend;

impl MockVisionBackend {
    pub const MODEL_NAME: &'static str = "mock-vision";

    fn demo_form(page: usize) -> serde_json::Value {
        json!({
            "form_title": "Medical Information Form",
            "document_type": "medical form",
            "explanation_text": "Demo extraction served without vision credentials.",
            "overall_confidence": 0.9,
            "questions": [
                {"question": "Patient Name", "answer": "John Doe", "page": page, "confidence": 0.95, "is_handwritten": true},
                {"question": "Patient ID", "answer": "12345", "page": page, "confidence": 0.9, "is_handwritten": true},
                {"question": "Date of Visit", "answer": "2023-10-15", "page": page, "confidence": 0.85, "is_handwritten": true}
            ],
            "metadata": {"mock": true}
        })
    }
}

#[async_trait]
impl VisionBackend for MockVisionBackend {
    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    async fn call(&self, request: VisionRequest<'_>) -> Result<String, VisionCallError> {
        Ok(Self::demo_form(request.image.page_number).to_string())
    }
}
