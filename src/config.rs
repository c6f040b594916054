//! Configuration types for document extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Credentials are passed per submission
//! as [`Credentials`] and are never part of the shared config.

use crate::error::TranscribeError;
use crate::pipeline::backend::VisionBackend;
use crate::progress::ProgressCallback;
use std::fmt;
use std::sync::Arc;

/// Default OpenAI-compatible API base.
pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Default vision model.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Upper bound for [`ExtractionConfigBuilder::max_retries`].
pub const MAX_RETRIES: u32 = 10;

/// Configuration for the extraction pipeline.
///
/// # Example
/// ```rust
/// use doctranscribe::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .dpi(200)
///     .max_pages(5)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pages, 5);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 300.
    ///
    /// Handwriting needs more pixels than print; 300 DPI keeps pen strokes
    /// legible for the vision model.
    pub dpi: u32,

    /// Longest rendered edge in pixels, independent of DPI. Default: 2500.
    pub max_rendered_pixels: u32,

    /// Pages beyond this are not rasterised. Default: 10.
    pub max_pages: usize,

    /// Vision model identifier. Default: `gpt-4.1`.
    pub model: String,

    /// Base URL of the OpenAI-compatible endpoint used with API-key credentials.
    pub api_base_url: String,

    /// Pre-constructed vision backend. Takes precedence over credentials.
    pub backend: Option<Arc<dyn VisionBackend>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4000.
    pub max_tokens: usize,

    /// Retries after the first attempt on a transient failure. Default: 2
    /// (three attempts in total).
    pub max_retries: u32,

    /// Initial retry delay in milliseconds; doubles per retry. Default: 2000.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Custom system prompt. If None, uses the built-in extraction prompt.
    pub system_prompt: Option<String>,

    /// Document confidence reported when no question carries a confidence.
    /// Default: 0.8.
    pub neutral_confidence: f64,

    /// Answer written into every question when all answers came back as
    /// low-information placeholders. Default: None (leave answers alone).
    pub empty_answer_placeholder: Option<String>,

    /// Characters of an unparsable response kept in `raw_content`. Default: 2000.
    pub raw_content_limit: usize,

    /// Serve a fixed demo form when no credentials are supplied. Default: false.
    pub mock_mode: bool,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 2500,
            max_pages: 10,
            model: DEFAULT_MODEL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            backend: None,
            temperature: 0.1,
            max_tokens: 4000,
            max_retries: 2,
            retry_backoff_ms: 2000,
            api_timeout_secs: 120,
            system_prompt: None,
            neutral_confidence: 0.8,
            empty_answer_placeholder: None,
            raw_content_limit: 2000,
            mock_mode: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("max_pages", &self.max_pages)
            .field("model", &self.model)
            .field("api_base_url", &self.api_base_url)
            .field("backend", &self.backend.as_ref().map(|_| "<dyn VisionBackend>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("neutral_confidence", &self.neutral_confidence)
            .field("empty_answer_placeholder", &self.empty_answer_placeholder)
            .field("mock_mode", &self.mock_mode)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Total attempts per page, first call included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn backend(mut self, backend: Arc<dyn VisionBackend>) -> Self {
        self.config.backend = Some(backend);
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

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(MAX_RETRIES);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn neutral_confidence(mut self, c: f64) -> Self {
        self.config.neutral_confidence = c;
        self
    }

    pub fn empty_answer_placeholder(mut self, text: impl Into<String>) -> Self {
        self.config.empty_answer_placeholder = Some(text.into());
        self
    }

    pub fn raw_content_limit(mut self, chars: usize) -> Self {
        self.config.raw_content_limit = chars;
        self
    }

    pub fn mock_mode(mut self, v: bool) -> Self {
        self.config.mock_mode = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, TranscribeError> {
        let c = &self.config;
        if c.max_pages == 0 {
            return Err(TranscribeError::InvalidConfig(
                "max_pages must be ≥ 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.neutral_confidence) {
            return Err(TranscribeError::InvalidConfig(format!(
                "neutral_confidence must be within 0.0–1.0, got {}",
                c.neutral_confidence
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(TranscribeError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(TranscribeError::InvalidConfig("model must not be empty".into()));
        }
        Ok(self.config)
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Caller-supplied credentials for the vision service.
///
/// The key is never printed: `Debug` shows only a short prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Returns `None` for a blank key so callers cannot smuggle an empty
    /// credential past the missing-credentials check.
    pub fn new(api_key: impl Into<String>) -> Option<Self> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            None
        } else {
            Some(Self { api_key })
        }
    }

    /// Read `OPENAI_API_KEY` from the environment.
    pub fn from_env() -> Option<Self> {
        std::env::var("OPENAI_API_KEY").ok().and_then(Self::new)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.api_key.chars().take(5).collect();
        f.debug_struct("Credentials")
            .field("api_key", &format!("{prefix}…"))
            .finish()
    }
}
