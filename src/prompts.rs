//! Prompts for VLM-based form extraction.
//!
//! The JSON shape requested here is the contract the response parser and the
//! reconciler rely on; keep the field names in sync with
//! [`crate::model::CombinedResult`].
//!
//! Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`].

/// Default system prompt for extracting one form page into JSON.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a handwriting recognition and form analysis expert. Extract every printed and handwritten element of the form page image and return it as structured JSON.

Follow these rules precisely:

1. CONTENT
   - Extract ALL visible text, printed and handwritten
   - Pair every question, label or field with its answer or value
   - Format dates and measured values consistently, keep units
   - If text is illegible, use "[ILLEGIBLE]"; for uncertain readings give your best interpretation

2. PER-FIELD DATA
   - "confidence": 0.0-1.0 for each answer
   - "is_handwritten": true for handwritten answers, false for printed
   - "page": the page number you were given

3. OUTPUT FORMAT
   Return ONLY a JSON object, no markdown fences, no commentary:
   {
     "form_title": "Title of the form",
     "document_type": "medical form, survey, application, ...",
     "explanation_text": "Introductory text explaining the form purpose",
     "header": {},
     "footer": {},
     "metadata": {"form_id": "", "version": ""},
     "overall_confidence": 0.0,
     "questions": [
       {"question": "", "answer": "", "page": 1, "confidence": 0.0, "is_handwritten": true}
     ],
     "sections": [],
     "tables": [],
     "signatures": [],
     "form_elements": {"checkboxes": [], "signatures": []},
     "notes": ""
   }"#;

/// Per-page user instruction sent alongside the page image.
pub fn page_instruction(page_number: usize) -> String {
    format!(
        "Extract all information from this form (page {page_number}). Identify every question \
and its answer, printed or handwritten. Set \"page\" to {page_number} for every question. \
Return ONLY the JSON object."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_names_every_combined_field() {
        for field in [
            "form_title",
            "document_type",
            "explanation_text",
            "questions",
            "confidence",
            "is_handwritten",
            "overall_confidence",
            "sections",
            "signatures",
            "tables",
        ] {
            assert!(DEFAULT_SYSTEM_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn page_instruction_carries_page_number() {
        let text = page_instruction(7);
        assert!(text.contains("page 7"));
        assert!(text.contains("\"page\" to 7"));
    }
}
