//! # doctranscribe
//!
//! Extract structured field/value data from scanned and handwritten PDF
//! forms with Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! OCR engines read characters; they don't know that "DOB" and the scrawl
//! next to it form a question/answer pair. This crate rasterises each page,
//! asks a VLM to return the form as JSON, and then does the deterministic
//! part carefully: retrying flaky calls, repairing schema drift between
//! pages, merging re-runs of the same page, and computing per-field and
//! per-document confidence.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 1. Register   store blob under documents/<id>.pdf, create Document
//!  ├─ 2. Submit     resolve credentials, create ExtractionJob, spawn task
//!  ├─ 3. Render     rasterise the first pages via pdfium (spawn_blocking)
//!  ├─ 4. Extract    one VLM call per page, sequential, retry + backoff
//!  ├─ 5. Reconcile  merge page results into the page-0 combined record
//!  └─ 6. Finish     job completed, or failed with a fallback record
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doctranscribe::{Credentials, ExtractionConfig, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(ExtractionConfig::default());
//!
//!     let bytes = std::fs::read("intake-form.pdf")?;
//!     let document = orchestrator.register_document("intake-form.pdf", bytes).await?;
//!
//!     let job_id = orchestrator
//!         .submit_extraction(document.id, Credentials::from_env())
//!         .await?;
//!     let status = orchestrator.wait(job_id).await?;
//!     eprintln!("job {} → {}", job_id, status.status);
//!
//!     let combined = orchestrator.get_combined_result(job_id).await?;
//!     for q in &combined.questions {
//!         println!("p{} {}: {}", q.page, q.question, q.answer);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doctranscribe` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod blob;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{Credentials, ExtractionConfig, ExtractionConfigBuilder};
pub use error::{TranscribeError, VisionCallError};
pub use model::{
    CombinedResult, Document, ExtractedField, ExtractionJob, ExtractionMethod, FormElements,
    JobStatus, JobStatusReport, PageExtractionResult, PageSummary, COMBINED_PAGE_NUMBER,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pipeline::backend::{
    LlmProviderBackend, MockVisionBackend, OpenAiVisionBackend, VisionBackend, VisionRequest,
};
pub use pipeline::encode::EncodedPage;
pub use pipeline::fallback::{FallbackExtractor, TextLayerFallback};
pub use pipeline::llm::VisionClient;
pub use pipeline::reconcile::{reconcile, ReconcileOptions, Reconciliation};
pub use pipeline::render::{PageRasterizer, PdfiumRasterizer, RenderedPage};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{ExtractionStore, FsStore, MemoryStore};
