//! Page reconciliation: merge per-page extraction results into one document
//! record.
//!
//! Vision models drift between pages: a title appears on page 1 only,
//! headers repeat with slight variations, a re-run of the same page answers
//! a question the first pass left blank. The rules here turn that into one
//! deterministic [`CombinedResult`]:
//!
//! | Field | Rule |
//! |-------|------|
//! | `form_title`, `document_type`, `explanation_text`, `notes` | page 1 wins, else longest, ties to the earliest page |
//! | `header`, `footer`, `metadata` | key-wise union, first non-empty value wins, nested objects merged recursively |
//! | `questions` | all pages in order; variants of one page merged on normalised question text |
//! | `sections`, `tables`, checkboxes, signatures | concatenated in page order |
//! | `overall_confidence` | mean of non-null question confidences, neutral default without any |
//!
//! Everything is pure: no clock, no randomness, and `serde_json::Map` is
//! ordered, so the same inputs serialise byte-identically.

use crate::config::ExtractionConfig;
use crate::model::{
    content_error, CombinedResult, ExtractedField, ExtractionMethod, FormElements,
    PageExtractionResult, PageSummary, COMBINED_PAGE_NUMBER,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Answers that carry no information about the field.
const LOW_INFORMATION_ANSWERS: &[&str] = &[
    "",
    "no answer provided",
    "no answer",
    "none provided",
    "[illegible]",
    "illegible",
    "[unclear]",
    "unclear",
    "[blank]",
    "blank",
];

/// Header-style fields: page 1 wins, else longest.
const HEADER_FIELDS: [&str; 4] = ["form_title", "document_type", "explanation_text", "notes"];

/// Knobs the reconciler reads from [`ExtractionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOptions {
    pub neutral_confidence: f64,
    pub empty_answer_placeholder: Option<String>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            neutral_confidence: 0.8,
            empty_answer_placeholder: None,
        }
    }
}

impl From<&ExtractionConfig> for ReconcileOptions {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            neutral_confidence: config.neutral_confidence,
            empty_answer_placeholder: config.empty_answer_placeholder.clone(),
        }
    }
}

/// Output of [`reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub combined: CombinedResult,
    /// Distinct pages with at least one non-error variant.
    pub usable_pages: usize,
    /// Sum of every real page's processing time, in seconds.
    pub processing_time: f64,
}

impl Reconciliation {
    /// The synthetic page-0 record for `job_id`.
    pub fn to_page_result(&self, job_id: Uuid) -> PageExtractionResult {
        PageExtractionResult {
            job_id,
            page_number: COMBINED_PAGE_NUMBER,
            variant: 0,
            content: self.combined.to_value(),
            processing_time: self.processing_time,
            confidence_score: self.combined.overall_confidence,
        }
    }
}

// ── Public entry point ───────────────────────────────────────────────────

/// Merge all page results of one job into a combined record.
///
/// Page-0 records in the input are ignored. Results sharing a page number
/// are treated as variants of that page, ordered by `variant`.
pub fn reconcile(
    document_id: Uuid,
    page_results: &[PageExtractionResult],
    options: &ReconcileOptions,
) -> Reconciliation {
    let mut ordered: Vec<&PageExtractionResult> =
        page_results.iter().filter(|r| !r.is_combined()).collect();
    ordered.sort_by_key(|r| (r.page_number, r.variant));

    let processing_time: f64 = ordered.iter().map(|r| r.processing_time.max(0.0)).sum();

    let mut by_page: BTreeMap<usize, Vec<&PageExtractionResult>> = BTreeMap::new();
    for r in ordered {
        by_page.entry(r.page_number).or_default().push(r);
    }

    let mut combined = CombinedResult {
        document_id,
        extraction_method: ExtractionMethod::Vision,
        ..CombinedResult::default()
    };

    // (page, content) of every usable variant, in page/variant order.
    let mut usable: Vec<(usize, &Value)> = Vec::new();
    let mut usable_pages = 0;
    let mut first_error: Option<String> = None;

    for (&page, variants) in &by_page {
        let ok: Vec<&PageExtractionResult> =
            variants.iter().copied().filter(|r| !r.is_error()).collect();

        if ok.is_empty() {
            let error = variants.last().and_then(|r| r.error());
            if first_error.is_none() {
                first_error = error.clone();
            }
            combined.pages.push(PageSummary {
                page,
                variants: variants.len(),
                question_count: 0,
                confidence: 0.0,
                error,
            });
            continue;
        }

        usable_pages += 1;
        let questions = merge_variants(page, &ok);
        let confidence = ok
            .iter()
            .map(|r| clamp_unit(r.confidence_score))
            .fold(0.0, f64::max);

        combined.pages.push(PageSummary {
            page,
            variants: variants.len(),
            question_count: questions.len(),
            confidence,
            error: None,
        });
        combined.questions.extend(questions);
        usable.extend(ok.iter().copied().map(|r| (page, &r.content)));
    }

    // Header-style strings.
    for field in HEADER_FIELDS {
        let value = pick_header_field(&usable, field);
        match field {
            "form_title" => combined.form_title = value,
            "document_type" => combined.document_type = value,
            "explanation_text" => combined.explanation_text = value,
            _ => combined.notes = value,
        }
    }

    // Nested objects.
    for (_, content) in &usable {
        merge_object_field(&mut combined.header, content.get("header"));
        merge_object_field(&mut combined.footer, content.get("footer"));
        merge_object_field(&mut combined.metadata, content.get("metadata"));
    }

    // Lists.
    let mut form_elements = FormElements::default();
    for (_, content) in &usable {
        extend_list(&mut combined.sections, content.get("sections"));
        extend_list(&mut combined.tables, content.get("tables"));
        extend_list(&mut form_elements.signatures, content.get("signatures"));
        if let Some(fe) = content.get("form_elements") {
            extend_list(&mut form_elements.checkboxes, fe.get("checkboxes"));
            extend_list(&mut form_elements.signatures, fe.get("signatures"));
        }
    }
    combined.form_elements = form_elements;

    if let Some(placeholder) = &options.empty_answer_placeholder {
        apply_placeholder(&mut combined, placeholder);
    }

    combined.overall_confidence =
        document_confidence(&combined.questions, options.neutral_confidence);

    if usable_pages == 0 {
        combined.error = Some(format!(
            "All {} pages failed extraction. First error: {}",
            by_page.len(),
            first_error.unwrap_or_else(|| "no pages were extracted".to_string())
        ));
    }

    Reconciliation {
        combined,
        usable_pages,
        processing_time,
    }
}

// ── Confidence ───────────────────────────────────────────────────────────

/// Per-page confidence for a freshly parsed content object.
///
/// The model's own `overall_confidence` wins when present; otherwise the
/// mean of the page's question confidences; otherwise `neutral`. Error
/// content scores 0.
pub fn page_confidence(content: &Value, neutral: f64) -> f64 {
    if content_error(content).is_some() {
        return 0.0;
    }
    if let Some(c) = content.get("overall_confidence").and_then(as_f64) {
        return clamp_unit(c);
    }
    let confidences: Vec<f64> = questions_array(content)
        .iter()
        .filter_map(|q| q.get("confidence").and_then(as_f64))
        .collect();
    mean(&confidences).map(clamp_unit).unwrap_or(clamp_unit(neutral))
}

fn document_confidence(questions: &[ExtractedField], neutral: f64) -> f64 {
    let confidences: Vec<f64> = questions.iter().filter_map(|q| q.confidence).collect();
    clamp_unit(mean(&confidences).unwrap_or(neutral))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── Questions ────────────────────────────────────────────────────────────

fn questions_key(content: &Value) -> &'static str {
    if content.get("questions").is_some() {
        "questions"
    } else {
        "fields"
    }
}

fn questions_array(content: &Value) -> &[Value] {
    content
        .get(questions_key(content))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// The question list `extract_questions` reads, mutably.
pub(crate) fn questions_array_mut(content: &mut Value) -> Option<&mut Vec<Value>> {
    let key = questions_key(content);
    content.get_mut(key).and_then(Value::as_array_mut)
}

/// Read a page's questions, tolerating the key drift models produce
/// (`label`/`field`, `value`/`response`, numeric answers, stringly numbers).
pub fn extract_questions(content: &Value, page: usize) -> Vec<ExtractedField> {
    questions_array(content)
        .iter()
        .map(|item| read_question(item, page))
        .collect()
}

fn read_question(item: &Value, page: usize) -> ExtractedField {
    let Value::Object(obj) = item else {
        return ExtractedField {
            question: value_text(item),
            answer: String::new(),
            page,
            confidence: None,
            is_handwritten: None,
        };
    };

    let first_of = |keys: &[&str]| keys.iter().find_map(|k| obj.get(*k)).map(value_text);

    let item_page = obj
        .get("page")
        .and_then(|p| p.as_u64().or_else(|| p.as_str().and_then(|s| s.trim().parse().ok())))
        .filter(|p| *p >= 1)
        .map(|p| p as usize);

    ExtractedField {
        question: first_of(&["question", "label", "field", "name"]).unwrap_or_default(),
        answer: first_of(&["answer", "value", "response"]).unwrap_or_default(),
        page: item_page.unwrap_or(page),
        confidence: obj.get("confidence").and_then(as_f64).map(clamp_unit),
        is_handwritten: obj.get("is_handwritten").and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }),
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Question text used as merge key.
fn normalize_question(text: &str) -> String {
    let collapsed = RE_WHITESPACE.replace_all(text.trim(), " ").to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c == ':' || c == '?' || c == '*' || c.is_whitespace())
        .to_string()
}

/// Whether an answer is a placeholder rather than real content.
pub fn is_low_information(answer: &str) -> bool {
    let a = RE_WHITESPACE.replace_all(answer.trim(), " ").to_lowercase();
    LOW_INFORMATION_ANSWERS.contains(&a.as_str())
}

/// Merge the questions of several variants of one page.
///
/// The first variant sets the order. A later variant's question is folded
/// into an earlier slot with the same normalised text (each slot at most
/// once per variant); anything unmatched is appended.
fn merge_variants(page: usize, variants: &[&PageExtractionResult]) -> Vec<ExtractedField> {
    let mut merged: Vec<ExtractedField> = Vec::new();
    let mut slots: HashMap<String, Vec<usize>> = HashMap::new();

    for (v_idx, variant) in variants.iter().enumerate() {
        let mut used: Vec<usize> = Vec::new();
        let mut added: Vec<(String, usize)> = Vec::new();

        for field in extract_questions(&variant.content, page) {
            let key = normalize_question(&field.question);
            let target = if v_idx == 0 || key.is_empty() {
                None
            } else {
                slots
                    .get(&key)
                    .and_then(|idxs| idxs.iter().copied().find(|i| !used.contains(i)))
            };

            match target {
                Some(i) => {
                    used.push(i);
                    merge_field(&mut merged[i], field);
                }
                None => {
                    added.push((key, merged.len()));
                    merged.push(field);
                }
            }
        }

        for (key, idx) in added {
            if !key.is_empty() {
                slots.entry(key).or_default().push(idx);
            }
        }
    }

    merged
}

/// Fold a later variant's field into the earlier one.
fn merge_field(existing: &mut ExtractedField, incoming: ExtractedField) {
    let existing_ok = !is_low_information(&existing.answer);
    let incoming_ok = !is_low_information(&incoming.answer);

    match (existing_ok, incoming_ok) {
        (true, true) => {
            existing.confidence = match (existing.confidence, incoming.confidence) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        (true, false) => {}
        // Informative replaces placeholder; among placeholders the latest attempt wins.
        (false, _) => {
            existing.answer = incoming.answer;
            existing.confidence = incoming.confidence.or(existing.confidence);
            existing.is_handwritten = incoming.is_handwritten.or(existing.is_handwritten);
        }
    }
}

fn apply_placeholder(combined: &mut CombinedResult, placeholder: &str) {
    if combined.questions.is_empty()
        || !combined.questions.iter().all(|q| is_low_information(&q.answer))
    {
        return;
    }
    for q in &mut combined.questions {
        q.answer = placeholder.to_string();
    }
    combined.remarks.push(format!(
        "No legible answers were found; every answer was set to \"{placeholder}\"."
    ));
}

// ── Header fields, objects and lists ─────────────────────────────────────

fn pick_header_field(usable: &[(usize, &Value)], field: &str) -> Option<String> {
    let candidates: Vec<(usize, String)> = usable
        .iter()
        .filter_map(|(page, content)| match content.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some((*page, s.trim().to_string())),
            _ => None,
        })
        .collect();

    if let Some((_, v)) = candidates.iter().find(|(page, _)| *page == 1) {
        return Some(v.clone());
    }

    let mut best: Option<&String> = None;
    for (_, v) in &candidates {
        if best.map_or(true, |b| v.chars().count() > b.chars().count()) {
            best = Some(v);
        }
    }
    best.cloned()
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn merge_object_field(acc: &mut Map<String, Value>, incoming: Option<&Value>) {
    match incoming {
        Some(Value::Object(obj)) => merge_maps(acc, obj),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            let mut wrapped = Map::new();
            wrapped.insert("text".to_string(), Value::String(s.trim().to_string()));
            merge_maps(acc, &wrapped);
        }
        _ => {}
    }
}

/// First non-empty value per key; nested objects merged recursively.
fn merge_maps(acc: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        if is_empty_value(value) {
            continue;
        }
        match acc.get_mut(key) {
            None => {
                acc.insert(key.clone(), value.clone());
            }
            Some(existing) if is_empty_value(existing) => {
                *existing = value.clone();
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(inner) = value {
                    merge_maps(existing, inner);
                }
            }
            Some(_) => {}
        }
    }
}

fn extend_list(acc: &mut Vec<Value>, incoming: Option<&Value>) {
    match incoming {
        Some(Value::Array(items)) => acc.extend(items.iter().filter(|v| !v.is_null()).cloned()),
        Some(v @ Value::Object(_)) => acc.push(v.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(page: usize, variant: usize, content: Value) -> PageExtractionResult {
        let confidence_score = page_confidence(&content, 0.8);
        PageExtractionResult {
            job_id: Uuid::nil(),
            page_number: page,
            variant,
            content,
            processing_time: 1.5,
            confidence_score,
        }
    }

    fn q(question: &str, answer: &str, confidence: f64) -> Value {
        json!({"question": question, "answer": answer, "confidence": confidence, "is_handwritten": true})
    }

    #[test]
    fn three_pages_keep_every_question() {
        let results: Vec<_> = (1..=3)
            .map(|p| {
                result(p, 0, json!({"questions": [q(&format!("Q{p}a"), "x", 0.9), q(&format!("Q{p}b"), "y", 0.7)]}))
            })
            .collect();
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions.len(), 6);
        assert_eq!(r.usable_pages, 3);
        assert!((r.combined.overall_confidence - 0.8).abs() < 1e-9);
        assert!((r.processing_time - 4.5).abs() < 1e-9);
        assert!(r.combined.questions.iter().all(|q| (1..=3).contains(&q.page)));
    }

    #[test]
    fn error_page_is_listed_but_not_averaged() {
        let results = vec![
            result(1, 0, json!({"questions": [q("Name", "Ann", 0.9)]})),
            result(2, 0, json!({"error": "Timeout"})),
            result(3, 0, json!({"questions": [q("City", "Oslo", 0.7)]})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.usable_pages, 2);
        assert_eq!(r.combined.questions.len(), 2);
        assert!((r.combined.overall_confidence - 0.8).abs() < 1e-9);
        let p2 = &r.combined.pages[1];
        assert_eq!(p2.page, 2);
        assert_eq!(p2.error.as_deref(), Some("Timeout"));
        assert_eq!(p2.confidence, 0.0);
        assert!(r.combined.error.is_none());
    }

    #[test]
    fn all_error_pages_mean_no_usable_pages() {
        let results = vec![
            result(1, 0, json!({"error": "HTTP 500"})),
            result(2, 0, json!({"error": "HTTP 500"})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.usable_pages, 0);
        assert!(r.combined.error.as_deref().unwrap().contains("All 2 pages"));
    }

    #[test]
    fn zero_questions_yield_neutral_confidence() {
        let results = vec![result(1, 0, json!({"form_title": "Blank"}))];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.overall_confidence, 0.8);

        let opts = ReconcileOptions {
            neutral_confidence: 0.5,
            ..Default::default()
        };
        assert_eq!(reconcile(Uuid::nil(), &results, &opts).combined.overall_confidence, 0.5);
    }

    #[test]
    fn informative_variant_answer_wins() {
        let results = vec![
            result(2, 0, json!({"questions": [q("Diagnosis", "", 0.3)]})),
            result(2, 1, json!({"questions": [q("diagnosis:", "Hypertension", 0.85)]})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions.len(), 1);
        let field = &r.combined.questions[0];
        assert_eq!(field.question, "Diagnosis");
        assert_eq!(field.answer, "Hypertension");
        assert_eq!(field.confidence, Some(0.85));
        assert_eq!(r.combined.pages[0].variants, 2);
    }

    #[test]
    fn informative_answer_is_not_replaced_by_placeholder() {
        let results = vec![
            result(1, 0, json!({"questions": [q("Name", "Ann", 0.6)]})),
            result(1, 1, json!({"questions": [q("Name", "[ILLEGIBLE]", 0.9)]})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions[0].answer, "Ann");
        assert_eq!(r.combined.questions[0].confidence, Some(0.6));
    }

    #[test]
    fn two_informative_answers_keep_first_and_higher_confidence() {
        let results = vec![
            result(1, 0, json!({"questions": [q("Name", "Ann", 0.6)]})),
            result(1, 1, json!({"questions": [q("Name", "Anne", 0.9)]})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions[0].answer, "Ann");
        assert_eq!(r.combined.questions[0].confidence, Some(0.9));
    }

    #[test]
    fn placeholders_only_keep_latest_attempt() {
        let results = vec![
            result(1, 0, json!({"questions": [q("Name", "", 0.2)]})),
            result(1, 1, json!({"questions": [q("Name", "[UNCLEAR]", 0.3)]})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions[0].answer, "[UNCLEAR]");
    }

    #[test]
    fn same_question_on_different_pages_is_not_merged() {
        let results = vec![
            result(1, 0, json!({"questions": [q("Signature", "", 0.5)]})),
            result(2, 0, json!({"questions": [q("Signature", "J. Doe", 0.9)]})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions.len(), 2);
    }

    #[test]
    fn repeated_question_within_one_variant_is_kept() {
        let results = vec![result(1, 0, json!({"questions": [q("Item", "a", 0.9), q("Item", "b", 0.9)]}))];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions.len(), 2);
    }

    #[test]
    fn header_fields_prefer_page_one_then_longest() {
        let results = vec![
            result(1, 0, json!({"form_title": "Intake", "questions": []})),
            result(2, 0, json!({"form_title": "Patient Intake Form (cont.)", "document_type": "form"})),
            result(3, 0, json!({"document_type": "medical form"})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.form_title.as_deref(), Some("Intake"));
        assert_eq!(r.combined.document_type.as_deref(), Some("medical form"));
        assert_eq!(r.combined.explanation_text, None);
    }

    #[test]
    fn longest_ties_go_to_earliest_page() {
        let results = vec![
            result(2, 0, json!({"notes": "abc"})),
            result(3, 0, json!({"notes": "xyz"})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.notes.as_deref(), Some("abc"));
    }

    #[test]
    fn metadata_is_merged_recursively() {
        let results = vec![
            result(1, 0, json!({"metadata": {"form_id": "", "clinic": {"name": "North"}}, "header": "ACME Clinic"})),
            result(2, 0, json!({"metadata": {"form_id": "F-12", "clinic": {"name": "South", "phone": "555"}}})),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.metadata["form_id"], "F-12");
        assert_eq!(r.combined.metadata["clinic"]["name"], "North");
        assert_eq!(r.combined.metadata["clinic"]["phone"], "555");
        assert_eq!(r.combined.header["text"], "ACME Clinic");
    }

    #[test]
    fn lists_are_concatenated_in_page_order() {
        let results = vec![
            result(2, 0, json!({"sections": [{"title": "B"}], "signatures": [{"who": "doctor"}]})),
            result(1, 0, json!({
                "sections": [{"title": "A"}],
                "tables": [{"rows": []}],
                "form_elements": {"checkboxes": [{"label": "Smoker", "checked": false}], "signatures": [{"who": "patient"}]}
            })),
        ];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.sections, vec![json!({"title": "A"}), json!({"title": "B"})]);
        assert_eq!(r.combined.tables.len(), 1);
        assert_eq!(r.combined.form_elements.checkboxes.len(), 1);
        assert_eq!(
            r.combined.form_elements.signatures,
            vec![json!({"who": "patient"}), json!({"who": "doctor"})]
        );
    }

    #[test]
    fn lenient_question_keys() {
        let content = json!({"questions": [
            {"label": "Age", "value": 42, "confidence": "0.7", "is_handwritten": "true"},
            "Loose question",
            {"question": "Name", "answer": null, "page": 9}
        ]});
        let fields = extract_questions(&content, 2);
        assert_eq!(fields[0].question, "Age");
        assert_eq!(fields[0].answer, "42");
        assert_eq!(fields[0].confidence, Some(0.7));
        assert_eq!(fields[0].is_handwritten, Some(true));
        assert_eq!(fields[0].page, 2);
        assert_eq!(fields[1].question, "Loose question");
        assert_eq!(fields[2].answer, "");
        assert_eq!(fields[2].page, 9);
    }

    #[test]
    fn confidences_are_clamped() {
        let results = vec![result(1, 0, json!({"questions": [q("A", "x", 1.4), q("B", "y", -0.2)]}))];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert!((r.combined.overall_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn page_confidence_prefers_model_value() {
        assert_eq!(page_confidence(&json!({"overall_confidence": 0.65, "questions": [q("A", "x", 0.1)]}), 0.8), 0.65);
        assert!((page_confidence(&json!({"questions": [q("A", "x", 0.4), q("B", "y", 0.6)]}), 0.8) - 0.5).abs() < 1e-9);
        assert_eq!(page_confidence(&json!({"questions": []}), 0.8), 0.8);
        assert_eq!(page_confidence(&json!({"error": "bad"}), 0.8), 0.0);
    }

    #[test]
    fn placeholder_applies_only_when_every_answer_is_empty() {
        let opts = ReconcileOptions {
            empty_answer_placeholder: Some("Faint handwriting".into()),
            ..Default::default()
        };
        let empty = vec![result(1, 0, json!({"questions": [q("A", "", 0.2), q("B", "[illegible]", 0.2)]}))];
        let r = reconcile(Uuid::nil(), &empty, &opts);
        assert!(r.combined.questions.iter().all(|q| q.answer == "Faint handwriting"));
        assert_eq!(r.combined.remarks.len(), 1);

        let mixed = vec![result(1, 0, json!({"questions": [q("A", "", 0.2), q("B", "yes", 0.9)]}))];
        let r = reconcile(Uuid::nil(), &mixed, &opts);
        assert_eq!(r.combined.questions[0].answer, "");
        assert!(r.combined.remarks.is_empty());
    }

    #[test]
    fn reconciliation_is_byte_identical() {
        let results = vec![
            result(1, 0, json!({"form_title": "T", "metadata": {"z": 1, "a": 2}, "questions": [q("A", "x", 0.9)]})),
            result(2, 0, json!({"header": {"b": "1", "a": "2"}, "questions": [q("B", "y", 0.3)]})),
            result(2, 1, json!({"questions": [q("B", "yy", 0.4)]})),
        ];
        let a = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        let b = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        let sa = serde_json::to_string(&a.to_page_result(Uuid::nil())).unwrap();
        let sb = serde_json::to_string(&b.to_page_result(Uuid::nil())).unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn combined_records_in_input_are_ignored() {
        let stale = result(COMBINED_PAGE_NUMBER, 0, json!({"questions": [q("Old", "x", 0.1)]}));
        let results = vec![stale, result(1, 0, json!({"questions": [q("New", "y", 0.9)]}))];
        let r = reconcile(Uuid::nil(), &results, &ReconcileOptions::default());
        assert_eq!(r.combined.questions.len(), 1);
        assert_eq!(r.combined.questions[0].question, "New");
    }
}
