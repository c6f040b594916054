//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the orchestrator works through a document. Durable progress is
//! always available through [`crate::Orchestrator::get_job_status`]; the
//! callback is for live UIs such as the CLI progress bar.
//!
//! # Example
//!
//! ```rust
//! use doctranscribe::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page: usize, total: usize, questions: usize, _confidence: f64) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {page}/{total}: {questions} questions");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::model::JobStatus;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the orchestrator as it processes each page.
///
/// Pages of one document are processed serially, but several documents may
/// run at once and share one callback, so implementations must be
/// `Send + Sync`. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once the PDF is rasterised and the page total is known.
    fn on_job_start(&self, job_id: Uuid, total_pages: usize) {
        let _ = (job_id, total_pages);
    }

    /// Called just before the vision request for a page.
    fn on_page_start(&self, page: usize, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// Called when a page produced parsable content.
    ///
    /// # Arguments
    /// * `question_count` — questions extracted from the page
    /// * `confidence`     — per-page confidence stored on the result
    fn on_page_complete(&self, page: usize, total_pages: usize, question_count: usize, confidence: f64) {
        let _ = (page, total_pages, question_count, confidence);
    }

    /// Called when a page ended as an error result.
    fn on_page_error(&self, page: usize, total_pages: usize, error: &str) {
        let _ = (page, total_pages, error);
    }

    /// Called once the job reached a terminal state.
    fn on_job_complete(&self, job_id: Uuid, status: JobStatus, usable_pages: usize) {
        let _ = (job_id, status, usable_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        final_status: Mutex<Option<JobStatus>>,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page: usize, _total: usize, _questions: usize, _confidence: f64) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_complete(&self, _job_id: Uuid, status: JobStatus, _usable: usize) {
            *self.final_status.lock().unwrap() = Some(status);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start(Uuid::nil(), 3);
        cb.on_page_start(1, 3);
        cb.on_page_complete(1, 3, 4, 0.9);
        cb.on_page_error(2, 3, "timeout");
        cb.on_job_complete(Uuid::nil(), JobStatus::Completed, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_start(1, 2);
        tracker.on_page_complete(1, 2, 5, 0.8);
        tracker.on_page_start(2, 2);
        tracker.on_page_error(2, 2, "HTTP 500");
        tracker.on_job_complete(Uuid::nil(), JobStatus::Completed, 1);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.final_status.lock().unwrap(), Some(JobStatus::Completed));
    }
}
