//! Second-chance extraction when the vision pipeline fails for a whole
//! document.
//!
//! The default [`TextLayerFallback`] reads the PDF's embedded text layer
//! (present in digitally filled forms, absent in pure scans) and recovers
//! `Label: value` lines as questions at a fixed, low confidence. It never
//! fails: without bytes or without any recoverable line it returns
//! [`CombinedResult::failure`].

use crate::model::{CombinedResult, Document, ExtractedField, ExtractionMethod, PageSummary};
use crate::pipeline::render::page_texts_blocking;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

/// Confidence assigned to every field recovered from the text layer.
pub const TEXT_LAYER_CONFIDENCE: f64 = 0.5;

static RE_FIELD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([^:\n]{2,80}?)\s*:\s*(.*?)\s*$").unwrap());

/// Non-vision extraction strategy.
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    /// Produce a displayable result for `document`.
    ///
    /// `pdf_bytes` is `None` when the blob itself could not be loaded;
    /// `reason` is the primary pipeline's failure message.
    async fn extract_fallback(
        &self,
        document: &Document,
        pdf_bytes: Option<Vec<u8>>,
        reason: &str,
    ) -> CombinedResult;
}

/// Text-layer fallback backed by pdfium.
#[derive(Debug, Clone)]
pub struct TextLayerFallback {
    max_pages: usize,
}

impl TextLayerFallback {
    pub fn new(max_pages: usize) -> Self {
        Self { max_pages }
    }
}

#[async_trait]
impl FallbackExtractor for TextLayerFallback {
    async fn extract_fallback(
        &self,
        document: &Document,
        pdf_bytes: Option<Vec<u8>>,
        reason: &str,
    ) -> CombinedResult {
        let Some(bytes) = pdf_bytes else {
            return CombinedResult::failure(document.id, reason);
        };

        let max_pages = self.max_pages;
        let texts = match tokio::task::spawn_blocking(move || page_texts_blocking(&bytes, max_pages)).await
        {
            Ok(Ok(texts)) => texts,
            Ok(Err(e)) => {
                warn!("Document {}: text layer unavailable: {}", document.id, e);
                return CombinedResult::failure(document.id, reason);
            }
            Err(e) => {
                warn!("Document {}: text extraction task panicked: {}", document.id, e);
                return CombinedResult::failure(document.id, reason);
            }
        };

        let result = combine_text_pages(document, &texts, reason);
        info!(
            "Document {}: fallback recovered {} field(s) from the text layer",
            document.id,
            result.questions.len()
        );
        result
    }
}

/// Build a combined record from per-page text. Pure; used by the fallback
/// and directly testable without pdfium.
pub fn combine_text_pages(document: &Document, texts: &[String], reason: &str) -> CombinedResult {
    let mut questions = Vec::new();
    let mut pages = Vec::new();

    for (idx, text) in texts.iter().enumerate() {
        let page = idx + 1;
        let fields = fields_from_text(text, page);
        pages.push(PageSummary {
            page,
            variants: 1,
            question_count: fields.len(),
            confidence: if fields.is_empty() { 0.0 } else { TEXT_LAYER_CONFIDENCE },
            error: None,
        });
        questions.extend(fields);
    }

    if questions.is_empty() {
        return CombinedResult::failure(document.id, reason);
    }

    CombinedResult {
        document_id: document.id,
        extraction_method: ExtractionMethod::Fallback,
        form_title: texts.first().and_then(|t| title_line(t)),
        overall_confidence: TEXT_LAYER_CONFIDENCE,
        questions,
        pages,
        error: Some(reason.to_string()),
        remarks: vec![format!(
            "Vision extraction failed ({reason}); fields were recovered from the PDF text layer \
and may be incomplete."
        )],
        ..CombinedResult::default()
    }
}

/// `Label: value` lines of one page.
pub fn fields_from_text(text: &str, page: usize) -> Vec<ExtractedField> {
    text.lines()
        .filter_map(|line| RE_FIELD_LINE.captures(line))
        .filter_map(|caps| {
            let question = caps.get(1)?.as_str().trim();
            // Times and URLs contain colons too.
            if question.chars().all(|c| c.is_ascii_digit())
                || question.ends_with("http")
                || question.ends_with("https")
            {
                return None;
            }
            Some(ExtractedField {
                question: question.to_string(),
                answer: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                page,
                confidence: Some(TEXT_LAYER_CONFIDENCE),
                is_handwritten: Some(false),
            })
        })
        .collect()
}

/// First short line that is not itself a field.
fn title_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && l.chars().count() <= 120 && !RE_FIELD_LINE.is_match(l))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: &str = "Patient Intake Form\n\nName: Jane Roe\nDate of Birth: 1980-02-03\n10:30 follow-up\nWebsite: https://clinic.example\nAllergies:\n";

    #[test]
    fn label_value_lines_become_fields() {
        let fields = fields_from_text(FORM, 1);
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|f| (f.question.as_str(), f.answer.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Name", "Jane Roe"),
                ("Date of Birth", "1980-02-03"),
                ("Website", "https://clinic.example"),
                ("Allergies", ""),
            ]
        );
        assert!(fields.iter().all(|f| f.page == 1 && f.is_handwritten == Some(false)));
    }

    #[test]
    fn combined_text_result_is_marked_fallback() {
        let doc = Document::new("intake.pdf", 100);
        let r = combine_text_pages(&doc, &[FORM.to_string(), String::new()], "HTTP 401");
        assert_eq!(r.extraction_method, ExtractionMethod::Fallback);
        assert_eq!(r.form_title.as_deref(), Some("Patient Intake Form"));
        assert_eq!(r.overall_confidence, TEXT_LAYER_CONFIDENCE);
        assert_eq!(r.pages.len(), 2);
        assert_eq!(r.pages[1].question_count, 0);
        assert!(r.remarks[0].contains("HTTP 401"));
    }

    #[test]
    fn empty_text_layer_yields_failure_record() {
        let doc = Document::new("scan.pdf", 100);
        let r = combine_text_pages(&doc, &[String::new()], "All 1 pages failed");
        assert_eq!(r.questions.len(), 1);
        assert_eq!(r.questions[0].answer, "Extraction failed");
        assert_eq!(r.overall_confidence, 0.0);
    }

    #[tokio::test]
    async fn missing_bytes_yield_failure_record() {
        let doc = Document::new("gone.pdf", 100);
        let r = TextLayerFallback::new(10)
            .extract_fallback(&doc, None, "blob missing")
            .await;
        assert_eq!(r.error.as_deref(), Some("blob missing"));
        assert_eq!(r.document_id, doc.id);
    }
}
