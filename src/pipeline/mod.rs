//! Pipeline stages for form extraction.
//!
//! Each submodule implements one step; the orchestrator strings them
//! together per document.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ llm ──▶ parse ──▶ reconcile
//! (URL/path)  (pdfium)  (base64)  (VLM)   (JSON)    (page 0)
//!                                   │
//!                                   └─ on total failure ──▶ fallback
//! ```
//!
//! 1. [`input`]     — resolve a CLI path or URL to PDF bytes
//! 2. [`render`]    — rasterise the first pages; pdfium runs in `spawn_blocking`
//! 3. [`encode`]    — PNG-encode and base64-wrap each page image
//! 4. [`llm`]       — one vision call per page with retry, backoff and timeout,
//!    over a [`backend`] implementation
//! 5. [`parse`]     — recover a JSON object from the model's text
//! 6. [`reconcile`] — merge page results into one combined record
//! 7. [`fallback`]  — text-layer extraction when vision fails for the whole
//!    document

pub mod backend;
pub mod encode;
pub mod fallback;
pub mod input;
pub mod llm;
pub mod parse;
pub mod reconcile;
pub mod render;
