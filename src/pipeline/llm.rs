//! Vision extraction client: one page image in, one page result out.
//!
//! This is the only stage with network I/O. It owns the retry policy,
//! the per-call timeout and response normalisation; the wire format of
//! the call itself belongs to the [`VisionBackend`].
//!
//! ## Retry Strategy
//!
//! Transient failures (timeouts, network errors, HTTP 5xx / 429) are retried
//! with exponential backoff (`retry_backoff_ms * 2^(attempt-1)`): with the
//! defaults of 2 s and three attempts the waits are 2 s → 4 s. Rejections
//! (HTTP 4xx, auth) are final on the first attempt.

use crate::config::{Credentials, ExtractionConfig};
use crate::error::{TranscribeError, VisionCallError};
use crate::model::PageExtractionResult;
use crate::pipeline::backend::{MockVisionBackend, OpenAiVisionBackend, VisionBackend, VisionRequest};
use crate::pipeline::encode::EncodedPage;
use crate::pipeline::parse::parse_response;
use crate::pipeline::reconcile::{page_confidence, questions_array_mut};
use crate::prompts::{page_instruction, DEFAULT_SYSTEM_PROMPT};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-page extraction against a resolved [`VisionBackend`].
#[derive(Clone)]
pub struct VisionClient {
    backend: Arc<dyn VisionBackend>,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    max_attempts: u32,
    retry_backoff_ms: u64,
    call_timeout: Duration,
    raw_content_limit: usize,
    neutral_confidence: f64,
}

impl std::fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionClient")
            .field("model", &self.backend.model_name())
            .field("max_attempts", &self.max_attempts)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl VisionClient {
    pub fn new(backend: Arc<dyn VisionBackend>, config: &ExtractionConfig) -> Self {
        Self {
            backend,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_attempts: config.max_attempts(),
            retry_backoff_ms: config.retry_backoff_ms,
            call_timeout: Duration::from_secs(config.api_timeout_secs),
            raw_content_limit: config.raw_content_limit,
            neutral_confidence: config.neutral_confidence,
        }
    }

    /// Resolve the backend, from most-specific to least-specific:
    ///
    /// 1. a backend pre-built into the config,
    /// 2. caller credentials → OpenAI-compatible HTTP backend,
    /// 3. the demo backend, only when `mock_mode` is on.
    ///
    /// Anything else is [`TranscribeError::MissingCredentials`]; no network
    /// call has been made at that point.
    pub fn resolve(
        credentials: Option<Credentials>,
        config: &ExtractionConfig,
    ) -> Result<Self, TranscribeError> {
        if let Some(backend) = &config.backend {
            return Ok(Self::new(Arc::clone(backend), config));
        }

        if let Some(credentials) = credentials {
            let backend = OpenAiVisionBackend::new(
                config.api_base_url.clone(),
                config.model.clone(),
                credentials,
                Duration::from_secs(config.api_timeout_secs),
            )?;
            return Ok(Self::new(Arc::new(backend), config));
        }

        if config.mock_mode {
            info!("No credentials supplied, serving demo extraction (mock mode)");
            return Ok(Self::new(Arc::new(MockVisionBackend), config));
        }

        Err(TranscribeError::MissingCredentials)
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Credential pre-flight. A rejection is fatal for the job; a transient
    /// failure is logged and the job proceeds.
    pub async fn validate(&self) -> Result<(), TranscribeError> {
        match timeout(self.call_timeout, self.backend.validate()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(VisionCallError::Rejected { detail, status })) => {
                Err(TranscribeError::CredentialsRejected {
                    detail: match status {
                        Some(s) => format!("HTTP {s}: {detail}"),
                        None => detail,
                    },
                })
            }
            Ok(Err(e)) => {
                warn!("Credential pre-flight inconclusive: {e}");
                Ok(())
            }
            Err(_) => {
                warn!("Credential pre-flight timed out after {:?}", self.call_timeout);
                Ok(())
            }
        }
    }

    /// Extract one page.
    ///
    /// Always returns a result: a page that could not be extracted carries
    /// `content.error` and confidence 0, so one bad page never aborts the
    /// document.
    pub async fn extract_page(&self, job_id: Uuid, image: &EncodedPage) -> PageExtractionResult {
        let start = Instant::now();
        let page = image.page_number;

        let content = match self.call_with_retry(image).await {
            Ok(raw) => {
                let mut content = parse_response(&raw, self.raw_content_limit);
                stamp_page_numbers(&mut content, page);
                content
            }
            Err((e, attempts)) => {
                warn!("Page {}: giving up after {} attempt(s): {}", page, attempts, e);
                json!({
                    "error": e.to_string(),
                    "attempts": attempts,
                })
            }
        };

        let confidence_score = page_confidence(&content, self.neutral_confidence);
        let processing_time = start.elapsed().as_secs_f64();
        debug!(
            "Page {}: confidence {:.2} in {:.2}s",
            page, confidence_score, processing_time
        );

        PageExtractionResult {
            job_id,
            page_number: page,
            variant: 0,
            content,
            processing_time,
            confidence_score,
        }
    }

    /// Delay before retry number `retry` (1-based), saturating at `u64::MAX`.
    fn backoff_ms(&self, retry: u32) -> u64 {
        self.retry_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)))
    }

    async fn call_with_retry(&self, image: &EncodedPage) -> Result<String, (VisionCallError, u32)> {
        let page = image.page_number;
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let backoff = self.backoff_ms(attempt);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    page,
                    attempt,
                    self.max_attempts - 1,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            attempt += 1;

            let request = VisionRequest {
                image,
                system_prompt: &self.system_prompt,
                instruction: page_instruction(page),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };

            let outcome = match timeout(self.call_timeout, self.backend.call(request)).await {
                Ok(r) => r,
                Err(_) => Err(VisionCallError::Transient {
                    detail: format!("timed out after {}s", self.call_timeout.as_secs()),
                }),
            };

            match outcome {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!("Page {}: attempt {} failed — {}", page, attempt, e);
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

/// Overwrite `page` on every question object with the page of the call.
fn stamp_page_numbers(content: &mut Value, page: usize) {
    if let Some(questions) = questions_array_mut(content) {
        for q in questions.iter_mut().filter_map(Value::as_object_mut) {
            q.insert("page".to_string(), json!(page));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes, one per call.
    struct Scripted {
        outcomes: Mutex<Vec<Result<String, VisionCallError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<String, VisionCallError>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl VisionBackend for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn call(&self, _request: VisionRequest<'_>) -> Result<String, VisionCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(VisionCallError::Transient { detail: "exhausted".into() }))
        }
    }

    fn image(page: usize) -> EncodedPage {
        EncodedPage {
            page_number: page,
            png_base64: "AAAA".into(),
            width: 1,
            height: 1,
        }
    }

    fn fast_config() -> ExtractionConfig {
        ExtractionConfig::builder().retry_backoff_ms(1).build().unwrap()
    }

    fn transient() -> Result<String, VisionCallError> {
        Err(VisionCallError::Transient { detail: "HTTP 503: busy".into() })
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let backend = Scripted::new(vec![
            transient(),
            Ok(r#"{"questions":[{"question":"Name","answer":"Ann","page":7,"confidence":0.9}]}"#.into()),
        ]);
        let client = VisionClient::new(backend.clone(), &fast_config());
        let r = client.extract_page(Uuid::nil(), &image(2)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert!(!r.is_error());
        assert_eq!(r.page_number, 2);
        assert_eq!(r.content["questions"][0]["page"], 2);
        assert!((r.confidence_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let backend = Scripted::new(vec![transient(), transient(), transient(), transient()]);
        let client = VisionClient::new(backend.clone(), &fast_config());
        let r = client.extract_page(Uuid::nil(), &image(1)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert!(r.is_error());
        assert_eq!(r.confidence_score, 0.0);
        assert_eq!(r.content["attempts"], 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let backend = Scripted::new(vec![Err(VisionCallError::from_status(401, "bad key"))]);
        let client = VisionClient::new(backend.clone(), &fast_config());
        let r = client.extract_page(Uuid::nil(), &image(1)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(r.error().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn unparsable_response_is_page_error_without_retry() {
        let backend = Scripted::new(vec![Ok("sorry, I can't".into())]);
        let client = VisionClient::new(backend.clone(), &fast_config());
        let r = client.extract_page(Uuid::nil(), &image(1)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.content["raw_content"], "sorry, I can't");
        assert_eq!(r.confidence_score, 0.0);
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = VisionClient::resolve(None, &ExtractionConfig::default()).unwrap_err();
        assert!(matches!(err, TranscribeError::MissingCredentials));
    }

    #[test]
    fn mock_mode_resolves_demo_backend() {
        let config = ExtractionConfig::builder().mock_mode(true).build().unwrap();
        let client = VisionClient::resolve(None, &config).unwrap();
        assert_eq!(client.model_name(), MockVisionBackend::MODEL_NAME);
    }

    #[test]
    fn configured_backend_takes_precedence() {
        let config = ExtractionConfig::builder()
            .backend(Scripted::new(vec![]))
            .mock_mode(true)
            .build()
            .unwrap();
        let client = VisionClient::resolve(Credentials::new("sk-x"), &config).unwrap();
        assert_eq!(client.model_name(), "scripted");
    }

    #[test]
    fn stamping_skips_non_object_questions() {
        let mut content = json!({"questions": [{"question": "A"}, "loose"]});
        stamp_page_numbers(&mut content, 4);
        assert_eq!(content["questions"][0]["page"], 4);
        assert_eq!(content["questions"][1], "loose");
    }

    #[tokio::test]
    async fn fields_alias_gets_page_of_the_call() {
        let backend = Scripted::new(vec![Ok(
            r#"{"fields":[{"question":"Name","answer":"Ann","page":9}]}"#.into(),
        )]);
        let client = VisionClient::new(backend, &fast_config());
        let r = client.extract_page(Uuid::nil(), &image(1)).await;
        assert_eq!(r.content["fields"][0]["page"], 1);

        let questions = crate::pipeline::reconcile::extract_questions(&r.content, 1);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].page, 1);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let config = ExtractionConfig::builder()
            .max_retries(u32::MAX)
            .retry_backoff_ms(u64::MAX / 2)
            .build()
            .unwrap();
        assert_eq!(config.max_retries, crate::config::MAX_RETRIES);

        let client = VisionClient::new(Scripted::new(vec![]), &config);
        assert_eq!(client.backoff_ms(1), u64::MAX / 2);
        assert_eq!(client.backoff_ms(70), u64::MAX);

        let client = VisionClient::new(Scripted::new(vec![]), &fast_config());
        assert_eq!(client.backoff_ms(3), 4);
    }
}
