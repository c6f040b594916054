//! Records owned by the extraction core: documents, jobs, page results and
//! the combined document-level result.
//!
//! Everything here is plain serde data so that any persistence sink
//! ([`crate::store::ExtractionStore`]) can store it as-is and downstream
//! consumers (spreadsheet export, UIs) read the same field names the vision
//! prompt asks for.

use crate::error::TranscribeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Page number reserved for the synthesised combined record.
pub const COMBINED_PAGE_NUMBER: usize = 0;

// ── Lifecycle ────────────────────────────────────────────────────────────

/// Lifecycle shared by documents and extraction jobs.
///
/// Jobs move strictly forward: `pending → processing → {completed, failed}`.
/// A document follows its latest job and may be re-entered into
/// `processing` by a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed forward transitions for a job.
    ///
    /// `pending → failed` is allowed so a job whose setup fails before the
    /// first page still ends in a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which strategy produced a combined record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    #[default]
    Vision,
    Fallback,
}

// ── Document ─────────────────────────────────────────────────────────────

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub file_size: u64,
    /// Blob store key, always [`Document::blob_key_for`] of the id.
    pub blob_key: String,
    /// Unknown until the PDF has been rasterised.
    pub page_count: Option<usize>,
    pub status: JobStatus,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(filename: impl Into<String>, file_size: u64) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            filename: filename.into(),
            file_size,
            blob_key: Self::blob_key_for(id),
            page_count: None,
            status: JobStatus::Pending,
            uploaded_at: Utc::now(),
        }
    }

    /// Canonical blob key for a document id.
    pub fn blob_key_for(id: Uuid) -> String {
        format!("documents/{id}.pdf")
    }
}

// ── ExtractionJob ────────────────────────────────────────────────────────

/// One attempt to extract a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub model_name: String,
    pub status: JobStatus,
    pub pages_processed: usize,
    pub total_pages: usize,
    /// Creation time; orders jobs of the same document.
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub confidence_score: Option<f64>,
    pub error_message: Option<String>,
    /// Strategy behind the stored page-0 record, once there is one.
    pub extraction_method: Option<ExtractionMethod>,
}

impl ExtractionJob {
    pub fn new(id: Uuid, document_id: Uuid, model_name: impl Into<String>) -> Self {
        Self {
            id,
            document_id,
            model_name: model_name.into(),
            status: JobStatus::Pending,
            pages_processed: 0,
            total_pages: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            confidence_score: None,
            error_message: None,
            extraction_method: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TranscribeError> {
        if !self.status.can_transition_to(next) {
            return Err(TranscribeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `pending → processing`.
    pub fn start(&mut self) -> Result<(), TranscribeError> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Set the page total once the PDF has been rasterised.
    pub fn set_total_pages(&mut self, total: usize) {
        self.total_pages = total;
        self.pages_processed = self.pages_processed.min(total);
    }

    /// Record that `page_number` pages are done.
    ///
    /// Never moves backwards and never exceeds `total_pages`.
    pub fn record_progress(&mut self, page_number: usize) {
        let next = page_number.min(self.total_pages);
        if next > self.pages_processed {
            self.pages_processed = next;
        }
    }

    /// `processing → completed`.
    pub fn complete(&mut self, confidence: f64) -> Result<(), TranscribeError> {
        self.transition(JobStatus::Completed)?;
        self.confidence_score = Some(confidence.clamp(0.0, 1.0));
        self.completed_at = Some(Utc::now());
        self.extraction_method = Some(ExtractionMethod::Vision);
        Ok(())
    }

    /// `{pending, processing} → failed`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TranscribeError> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn status_report(&self) -> JobStatusReport {
        JobStatusReport {
            job_id: self.id,
            document_id: self.document_id,
            status: self.status,
            pages_processed: self.pages_processed,
            total_pages: self.total_pages,
            error_message: self.error_message.clone(),
            confidence_score: self.confidence_score,
        }
    }
}

/// Cheap, side-effect-free view of a job for polling callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub status: JobStatus,
    pub pages_processed: usize,
    pub total_pages: usize,
    pub error_message: Option<String>,
    pub confidence_score: Option<f64>,
}

// ── Page results ─────────────────────────────────────────────────────────

/// One page's raw extraction outcome, or the page-0 combined record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageExtractionResult {
    pub job_id: Uuid,
    /// 1-indexed; [`COMBINED_PAGE_NUMBER`] for the combined record.
    pub page_number: usize,
    /// Extraction pass over the same page image; `0` for the first pass.
    #[serde(default)]
    pub variant: usize,
    /// Document-shaped JSON object as returned by the vision model, or
    /// `{"error": …}` when the page failed.
    pub content: Value,
    /// Wall-clock seconds spent on this page.
    pub processing_time: f64,
    pub confidence_score: f64,
}

impl PageExtractionResult {
    /// Error text if this page failed.
    pub fn error(&self) -> Option<String> {
        content_error(&self.content)
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn is_combined(&self) -> bool {
        self.page_number == COMBINED_PAGE_NUMBER
    }
}

/// `content.error` as text, treating `null`/`""`/`false` as "no error".
pub(crate) fn content_error(content: &Value) -> Option<String> {
    match content.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

// ── Combined result ──────────────────────────────────────────────────────

/// A question/label and its answer, the reconciler's unit of merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub question: String,
    pub answer: String,
    pub page: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_handwritten: Option<bool>,
}

/// Checkboxes and signatures collected from every page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormElements {
    pub checkboxes: Vec<Value>,
    pub signatures: Vec<Value>,
}

/// Per-page line in the combined record so consumers can see which pages
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page: usize,
    pub variants: usize,
    pub question_count: usize,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The single merged document-level extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub document_id: Uuid,
    pub extraction_method: ExtractionMethod,
    pub form_title: Option<String>,
    pub document_type: Option<String>,
    pub explanation_text: Option<String>,
    pub notes: Option<String>,
    pub header: Map<String, Value>,
    pub footer: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub overall_confidence: f64,
    pub questions: Vec<ExtractedField>,
    pub sections: Vec<Value>,
    pub tables: Vec<Value>,
    pub form_elements: FormElements,
    pub pages: Vec<PageSummary>,
    /// Set when the record describes a failed extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable remarks (fallback notes, placeholder injection).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remarks: Vec<String>,
}

impl CombinedResult {
    /// Displayable record for a document that could not be extracted at all.
    pub fn failure(document_id: Uuid, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            document_id,
            extraction_method: ExtractionMethod::Fallback,
            overall_confidence: 0.0,
            questions: vec![ExtractedField {
                question: "Extraction status".to_string(),
                answer: "Extraction failed".to_string(),
                page: 1,
                confidence: Some(0.0),
                is_handwritten: Some(false),
            }],
            remarks: vec![format!(
                "The document could not be extracted automatically: {error}"
            )],
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a stored page-0 content object back into a result.
    pub fn from_value(value: &Value) -> Result<Self, TranscribeError> {
        serde_json::from_value(value.clone())
            .map_err(|e| TranscribeError::Storage(format!("invalid combined record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_lifecycle_moves_forward_only() {
        let mut job = ExtractionJob::new(Uuid::new_v4(), Uuid::new_v4(), "gpt-4.1");
        assert_eq!(job.status, JobStatus::Pending);
        job.start().unwrap();
        assert!(job.started_at.is_some());
        job.complete(0.9).unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let err = job.start().unwrap_err();
        assert!(matches!(err, TranscribeError::InvalidTransition { .. }));
        assert!(job.fail("late").is_err());
        assert_eq!(job.error_message, None);
    }

    #[test]
    fn pending_job_may_fail_directly() {
        let mut job = ExtractionJob::new(Uuid::new_v4(), Uuid::new_v4(), "m");
        job.fail("blob missing").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("blob missing"));
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let mut job = ExtractionJob::new(Uuid::new_v4(), Uuid::new_v4(), "m");
        job.set_total_pages(3);
        job.record_progress(2);
        job.record_progress(1);
        assert_eq!(job.pages_processed, 2);
        job.record_progress(9);
        assert_eq!(job.pages_processed, 3);
    }

    #[test]
    fn completion_clamps_confidence() {
        let mut job = ExtractionJob::new(Uuid::new_v4(), Uuid::new_v4(), "m");
        job.start().unwrap();
        job.complete(1.7).unwrap();
        assert_eq!(job.confidence_score, Some(1.0));
    }

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(serde_json::to_value(JobStatus::Processing).unwrap(), json!("processing"));
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn content_error_detection() {
        assert_eq!(content_error(&json!({"error": "timeout"})).as_deref(), Some("timeout"));
        assert_eq!(content_error(&json!({"error": null})), None);
        assert_eq!(content_error(&json!({"error": ""})), None);
        assert_eq!(content_error(&json!({"questions": []})), None);
        assert_eq!(content_error(&json!({"error": {"code": 5}})).as_deref(), Some("{\"code\":5}"));
    }

    #[test]
    fn blob_key_is_derived_from_id() {
        let doc = Document::new("form.pdf", 10);
        assert_eq!(doc.blob_key, format!("documents/{}.pdf", doc.id));
        assert_eq!(doc.page_count, None);
    }

    #[test]
    fn failure_record_is_displayable() {
        let id = Uuid::new_v4();
        let r = CombinedResult::failure(id, "PDF could not be read");
        assert_eq!(r.questions.len(), 1);
        assert_eq!(r.overall_confidence, 0.0);
        assert_eq!(r.extraction_method, ExtractionMethod::Fallback);
        let back = CombinedResult::from_value(&r.to_value()).unwrap();
        assert_eq!(back, r);
    }
}
