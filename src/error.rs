//! Error types for the doctranscribe library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TranscribeError`] — **Fatal** for the operation that returned it: the
//!   document cannot be found, the PDF cannot be read, no credentials were
//!   supplied, a store write failed. Returned as `Err(TranscribeError)` from
//!   the orchestrator's public API and from the collaborator traits.
//!
//! * [`VisionCallError`] — **Non-fatal**: a single call to the vision
//!   capability failed. The client retries transient failures and turns the
//!   final error into a page result with `content.error` set, so one bad
//!   page never aborts the document.

use crate::model::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the doctranscribe library.
///
/// Page-level vision failures use [`VisionCallError`] and end up inside
/// [`crate::model::PageExtractionResult::content`] rather than here.
#[derive(Debug, Error)]
pub enum TranscribeError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No document with this id exists in the store.
    #[error("Document {id} not found")]
    DocumentNotFound { id: Uuid },

    /// No extraction job with this id exists in the store.
    #[error("Extraction job {id} not found")]
    JobNotFound { id: Uuid },

    /// The job exists but has not produced its combined result yet.
    #[error("Extraction job {id} is not finished yet (status: {status})")]
    NotReady { id: Uuid, status: JobStatus },

    /// The blob store has nothing under this key.
    #[error("Blob '{key}' not found")]
    BlobNotFound { key: String },

    // ── Input / PDF errors ────────────────────────────────────────────────
    /// The bytes are not a PDF at all (wrong magic).
    #[error("'{filename}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { filename: String, magic: Vec<u8> },

    /// pdfium could not open the document.
    #[error("PDF could not be read: {detail}")]
    UnreadablePdf { detail: String },

    /// pdfium failed on one page after the document was opened.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The rasterised page could not be PNG-encoded.
    #[error("Encoding page {page} failed: {detail}")]
    EncodingFailed { page: usize, detail: String },

    /// Input could not be resolved to PDF bytes (CLI path or URL).
    #[error("Failed to read '{input}': {reason}")]
    InputUnavailable { input: String, reason: String },

    // ── Credential / vision errors ────────────────────────────────────────
    /// No credentials were supplied and mock mode is off.
    #[error(
        "No vision credentials supplied.\n\
Pass an API key, set OPENAI_API_KEY, configure a provider, or enable mock mode."
    )]
    MissingCredentials,

    /// The credential pre-flight check was rejected by the vision service.
    #[error("Vision credentials rejected: {detail}")]
    CredentialsRejected { detail: String },

    /// A vision provider could not be constructed.
    #[error("Vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Every page failed; the reconciler found nothing usable.
    #[error("All {total} pages failed extraction.\nFirst error: {first_error}")]
    NoUsablePages { total: usize, first_error: String },

    // ── Lifecycle errors ──────────────────────────────────────────────────
    /// A job or document status change would break the monotonic lifecycle.
    #[error("Invalid status transition {from} → {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    // ── Storage errors ────────────────────────────────────────────────────
    /// The persistence sink or blob store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Filesystem I/O failed while reading or writing `path`.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal failure of a single vision call.
///
/// The distinction between the two variants drives the retry policy in
/// [`crate::pipeline::llm::VisionClient`].
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum VisionCallError {
    /// Timeouts, network failures, HTTP 5xx and 429. Retried with backoff.
    #[error("transient vision failure: {detail}")]
    Transient { detail: String },

    /// HTTP 4xx (auth, bad request) or a provider-side rejection. Never retried.
    #[error("vision request rejected{}: {detail}", http_suffix(.status))]
    Rejected { status: Option<u16>, detail: String },
}

impl VisionCallError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VisionCallError::Transient { .. })
    }

    /// Classify an HTTP status code returned by the vision endpoint.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let detail = body.into();
        if status == 429 || status >= 500 {
            VisionCallError::Transient {
                detail: format!("HTTP {status}: {detail}"),
            }
        } else {
            VisionCallError::Rejected {
                status: Some(status),
                detail,
            }
        }
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_display_mentions_mock_mode() {
        let msg = TranscribeError::MissingCredentials.to_string();
        assert!(msg.contains("mock mode"), "got: {msg}");
    }

    #[test]
    fn no_usable_pages_display() {
        let e = TranscribeError::NoUsablePages {
            total: 4,
            first_error: "timeout".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("All 4 pages"), "got: {msg}");
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn invalid_transition_display() {
        let e = TranscribeError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Processing,
        };
        assert_eq!(e.to_string(), "Invalid status transition completed → processing");
    }

    #[test]
    fn status_classification() {
        assert!(VisionCallError::from_status(503, "busy").is_retryable());
        assert!(VisionCallError::from_status(429, "slow down").is_retryable());
        assert!(!VisionCallError::from_status(401, "bad key").is_retryable());
        assert!(!VisionCallError::from_status(400, "bad request").is_retryable());
    }

    #[test]
    fn rejected_display_includes_status() {
        let e = VisionCallError::from_status(403, "forbidden");
        assert_eq!(e.to_string(), "vision request rejected (HTTP 403): forbidden");

        let e = VisionCallError::Rejected {
            status: None,
            detail: "content filter".into(),
        };
        assert_eq!(e.to_string(), "vision request rejected: content filter");
    }
}
