//! Extraction orchestration: register → submit → rasterise → extract per
//! page → reconcile → terminal status.
//!
//! ## One task per job
//!
//! [`Orchestrator::submit_extraction`] validates the request synchronously
//! (credentials, document lookup, one-active-job rule), persists a `pending`
//! job and spawns the run on its own Tokio task. Callers poll
//! [`Orchestrator::get_job_status`] or await [`Orchestrator::wait`].
//!
//! Pages of one document are processed strictly in order; several documents
//! run concurrently. The only shared mutable state is the active-job
//! registry, guarded by a `std::sync::Mutex` that is never held across an
//! `.await`.
//!
//! ## Failure policy
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | one page fails | error page result, job continues |
//! | blob missing, unreadable PDF, zero pages, credentials rejected, zero usable pages | job `failed`, fallback result stored as page 0 |
//! | cancellation | job `failed` with "cancelled", no fallback |
//! | store error or panic inside the run | caught at the top, job `failed` |

use crate::blob::{BlobStore, MemoryBlobStore};
use crate::config::{Credentials, ExtractionConfig};
use crate::error::TranscribeError;
use crate::model::{
    CombinedResult, Document, ExtractionJob, ExtractionMethod, JobStatus, JobStatusReport,
    PageExtractionResult, COMBINED_PAGE_NUMBER,
};
use crate::pipeline::encode::encode_page;
use crate::pipeline::fallback::{FallbackExtractor, TextLayerFallback};
use crate::pipeline::input::ensure_pdf;
use crate::pipeline::llm::VisionClient;
use crate::pipeline::reconcile::{extract_questions, reconcile, ReconcileOptions};
use crate::pipeline::render::{PageRasterizer, PdfiumRasterizer};
use crate::store::{ExtractionStore, MemoryStore};
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error message recorded on cancelled jobs.
pub const CANCELLED_MESSAGE: &str = "cancelled";

struct ActiveJob {
    job_id: Uuid,
    cancel: Arc<AtomicBool>,
    /// Flips to `true` once the job task has finished.
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    /// document id → its active job
    active: HashMap<Uuid, ActiveJob>,
}

struct Inner {
    config: ExtractionConfig,
    store: Arc<dyn ExtractionStore>,
    blobs: Arc<dyn BlobStore>,
    rasterizer: Arc<dyn PageRasterizer>,
    fallback: Arc<dyn FallbackExtractor>,
    registry: Mutex<Registry>,
}

/// Owns the job state machine for every document it is given.
///
/// Cheap to clone; clones share the registry and collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Orchestrator`]. Every collaborator has a default:
/// in-memory stores, the pdfium rasterizer and the text-layer fallback.
pub struct OrchestratorBuilder {
    config: ExtractionConfig,
    store: Option<Arc<dyn ExtractionStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    rasterizer: Option<Arc<dyn PageRasterizer>>,
    fallback: Option<Arc<dyn FallbackExtractor>>,
}

impl OrchestratorBuilder {
    pub fn store(mut self, store: Arc<dyn ExtractionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackExtractor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let rasterizer = self
            .rasterizer
            .unwrap_or_else(|| Arc::new(PdfiumRasterizer::from_config(&config)));
        let fallback = self
            .fallback
            .unwrap_or_else(|| Arc::new(TextLayerFallback::new(config.max_pages)));
        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                blobs: self.blobs.unwrap_or_else(|| Arc::new(MemoryBlobStore::new())),
                rasterizer,
                fallback,
                registry: Mutex::new(Registry::default()),
                config,
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder(config: ExtractionConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: None,
            blobs: None,
            rasterizer: None,
            fallback: None,
        }
    }

    /// Orchestrator with every default collaborator.
    pub fn new(config: ExtractionConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.inner.config
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, TranscribeError> {
        self.inner
            .registry
            .lock()
            .map_err(|_| TranscribeError::Internal("job registry lock poisoned".into()))
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Store an uploaded PDF and create its `pending` document.
    pub async fn register_document(
        &self,
        filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Document, TranscribeError> {
        let filename = filename.into();
        ensure_pdf(&filename, &bytes)?;

        let document = Document::new(filename, bytes.len() as u64);
        self.inner.blobs.put(&document.blob_key, bytes).await?;
        self.inner.store.put_document(&document).await?;
        info!(
            "Registered document {} ({}, {} bytes)",
            document.id, document.filename, document.file_size
        );
        Ok(document)
    }

    pub async fn get_document(&self, document_id: Uuid) -> Result<Document, TranscribeError> {
        self.inner
            .store
            .get_document(document_id)
            .await?
            .ok_or(TranscribeError::DocumentNotFound { id: document_id })
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Start extracting a document and return the job id.
    ///
    /// Credentials are resolved first: without them (and without a
    /// configured backend or mock mode) this fails with
    /// [`TranscribeError::MissingCredentials`] and nothing is created. If
    /// the document already has an active job, that job's id is returned.
    pub async fn submit_extraction(
        &self,
        document_id: Uuid,
        credentials: Option<Credentials>,
    ) -> Result<Uuid, TranscribeError> {
        let client = VisionClient::resolve(credentials, &self.inner.config)?;
        let document = self.get_document(document_id).await?;

        let job_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut registry = self.registry()?;
            if let Some(active) = registry.active.get(&document_id) {
                info!(
                    "Document {} already has active job {}",
                    document_id, active.job_id
                );
                return Ok(active.job_id);
            }
            registry.active.insert(
                document_id,
                ActiveJob {
                    job_id,
                    cancel: Arc::clone(&cancel),
                    done: done_rx,
                },
            );
        }

        let job = ExtractionJob::new(job_id, document.id, client.model_name());
        if let Err(e) = self.inner.store.put_job(&job).await {
            self.release(document_id, job_id);
            return Err(e);
        }
        info!("Job {} submitted for document {} ({})", job_id, document_id, client.model_name());

        let this = self.clone();
        tokio::spawn(async move {
            this.run_guarded(job_id, document_id, client, cancel).await;
            let _ = done_tx.send(true);
        });
        Ok(job_id)
    }

    /// Wait for a submitted job to finish and return its final status.
    ///
    /// A job that is no longer active has already reached its terminal
    /// state, so this returns immediately for it.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobStatusReport, TranscribeError> {
        let done = self
            .registry()?
            .active
            .values()
            .find(|a| a.job_id == job_id)
            .map(|a| a.done.clone());
        if let Some(mut done) = done {
            if done.wait_for(|finished| *finished).await.is_err() {
                warn!("Job {}: task ended without reporting completion", job_id);
            }
        }
        self.get_job_status(job_id).await
    }

    /// Request cancellation; honoured before the next page.
    ///
    /// Returns `false` when the job is no longer active.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, TranscribeError> {
        {
            let registry = self.registry()?;
            if let Some(active) = registry.active.values().find(|a| a.job_id == job_id) {
                active.cancel.store(true, Ordering::SeqCst);
                info!("Job {}: cancellation requested", job_id);
                return Ok(true);
            }
        }
        self.load_job(job_id).await.map(|_| false)
    }

    fn release(&self, document_id: Uuid, job_id: Uuid) {
        if let Ok(mut registry) = self.registry() {
            if registry
                .active
                .get(&document_id)
                .is_some_and(|a| a.job_id == job_id)
            {
                registry.active.remove(&document_id);
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    async fn load_job(&self, job_id: Uuid) -> Result<ExtractionJob, TranscribeError> {
        self.inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(TranscribeError::JobNotFound { id: job_id })
    }

    /// Status, progress and error of a job. Pure read.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatusReport, TranscribeError> {
        Ok(self.load_job(job_id).await?.status_report())
    }

    /// The combined record of a finished job.
    ///
    /// A failed job yields its stored fallback record (or a synthesised
    /// failure record), never an error.
    pub async fn get_combined_result(&self, job_id: Uuid) -> Result<CombinedResult, TranscribeError> {
        let job = self.load_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(TranscribeError::NotReady {
                id: job_id,
                status: job.status,
            });
        }

        let stored = self
            .inner
            .store
            .list_page_results(job_id)
            .await?
            .into_iter()
            .find(|r| r.page_number == COMBINED_PAGE_NUMBER);

        match (stored, job.status) {
            (Some(record), _) => CombinedResult::from_value(&record.content),
            (None, JobStatus::Failed) => Ok(CombinedResult::failure(
                job.document_id,
                job.error_message.unwrap_or_else(|| "extraction failed".to_string()),
            )),
            (None, _) => Err(TranscribeError::Storage(format!(
                "combined record of job {job_id} is missing"
            ))),
        }
    }

    /// All jobs of a document, newest first.
    pub async fn list_jobs(&self, document_id: Uuid) -> Result<Vec<ExtractionJob>, TranscribeError> {
        self.get_document(document_id).await?;
        self.inner.store.list_jobs(document_id).await
    }

    /// The most recently created job of a document.
    pub async fn latest_job(
        &self,
        document_id: Uuid,
    ) -> Result<Option<ExtractionJob>, TranscribeError> {
        Ok(self.list_jobs(document_id).await?.into_iter().next())
    }

    /// Page results of a job, page 0 (if written) first.
    pub async fn list_page_results(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PageExtractionResult>, TranscribeError> {
        self.load_job(job_id).await?;
        self.inner.store.list_page_results(job_id).await
    }

    // ── Run ──────────────────────────────────────────────────────────────

    /// Top of the job task: nothing escapes, not even a panic.
    async fn run_guarded(
        &self,
        job_id: Uuid,
        document_id: Uuid,
        client: VisionClient,
        cancel: Arc<AtomicBool>,
    ) {
        let outcome = AssertUnwindSafe(self.run(job_id, document_id, &client, &cancel))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("internal panic: {}", panic_message(&*panic))),
        };
        if let Some(message) = failure {
            error!("Job {}: {}", job_id, message);
            if let Err(e) = self.mark_failed(job_id, document_id, &message).await {
                error!("Job {}: could not record failure: {}", job_id, e);
            }
        }

        if let Some(cb) = &self.inner.config.progress_callback {
            match self.inner.store.get_job(job_id).await {
                Ok(Some(job)) => cb.on_job_complete(job_id, job.status, job.pages_processed),
                _ => cb.on_job_complete(job_id, JobStatus::Failed, 0),
            }
        }

        // Released last: once a job leaves the registry its callbacks have run.
        self.release(document_id, job_id);
    }

    /// Last-resort failure marking for errors that escaped [`Self::run`].
    async fn mark_failed(
        &self,
        job_id: Uuid,
        document_id: Uuid,
        message: &str,
    ) -> Result<(), TranscribeError> {
        let mut job = self.load_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.fail(message)?;
        self.inner.store.put_job(&job).await?;

        if let Some(mut document) = self.inner.store.get_document(document_id).await? {
            document.status = JobStatus::Failed;
            self.inner.store.put_document(&document).await?;
        }
        Ok(())
    }

    async fn run(
        &self,
        job_id: Uuid,
        document_id: Uuid,
        client: &VisionClient,
        cancel: &AtomicBool,
    ) -> Result<(), TranscribeError> {
        let store = &self.inner.store;
        let config = &self.inner.config;
        let callback = config.progress_callback.as_ref();

        let mut job = self.load_job(job_id).await?;
        let mut document = self.get_document(document_id).await?;

        job.start()?;
        store.put_job(&job).await?;
        document.status = JobStatus::Processing;
        store.put_document(&document).await?;
        info!("Job {}: processing {}", job_id, document.filename);

        // ── Step 1: Load the PDF ─────────────────────────────────────────
        let bytes = match self.inner.blobs.get(&document.blob_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .fail_with_fallback(&mut job, &mut document, None, e.to_string())
                    .await;
            }
        };

        // ── Step 2: Credential pre-flight ────────────────────────────────
        if let Err(e) = client.validate().await {
            return self
                .fail_with_fallback(&mut job, &mut document, Some(bytes), e.to_string())
                .await;
        }

        // ── Step 3: Rasterise ────────────────────────────────────────────
        let render_start = Instant::now();
        let pages = match self
            .inner
            .rasterizer
            .rasterize(bytes.clone(), config.max_pages)
            .await
        {
            Ok(pages) if pages.is_empty() => {
                return self
                    .fail_with_fallback(
                        &mut job,
                        &mut document,
                        Some(bytes),
                        "PDF contains no pages".to_string(),
                    )
                    .await;
            }
            Ok(pages) => pages,
            Err(e) => {
                return self
                    .fail_with_fallback(&mut job, &mut document, Some(bytes), e.to_string())
                    .await;
            }
        };
        let total = pages.len();
        info!(
            "Job {}: rasterised {} page(s) in {}ms",
            job_id,
            total,
            render_start.elapsed().as_millis()
        );

        job.set_total_pages(total);
        store.put_job(&job).await?;
        document.page_count = Some(total);
        store.put_document(&document).await?;
        if let Some(cb) = callback {
            cb.on_job_start(job_id, total);
        }

        // ── Step 4: Extract page by page ─────────────────────────────────
        let mut results = Vec::with_capacity(total);
        for page in pages {
            if cancel.load(Ordering::SeqCst) {
                info!("Job {}: cancelled before page {}", job_id, page.page_number);
                job.fail(CANCELLED_MESSAGE)?;
                store.put_job(&job).await?;
                document.status = JobStatus::Failed;
                store.put_document(&document).await?;
                return Ok(());
            }

            let page_number = page.page_number;
            if let Some(cb) = callback {
                cb.on_page_start(page_number, total);
            }

            let result = match encode_page(&page) {
                Ok(encoded) => client.extract_page(job_id, &encoded).await,
                Err(e) => {
                    warn!("Job {}: {}", job_id, e);
                    PageExtractionResult {
                        job_id,
                        page_number,
                        variant: 0,
                        content: json!({"error": e.to_string()}),
                        processing_time: 0.0,
                        confidence_score: 0.0,
                    }
                }
            };
            drop(page);

            store.put_page_result(&result).await?;
            job.record_progress(page_number);
            store.put_job(&job).await?;
            debug!("Job {}: page {}/{} stored", job_id, page_number, total);

            if let Some(cb) = callback {
                match result.error() {
                    Some(err) => cb.on_page_error(page_number, total, &err),
                    None => cb.on_page_complete(
                        page_number,
                        total,
                        extract_questions(&result.content, page_number).len(),
                        result.confidence_score,
                    ),
                }
            }
            results.push(result);
        }

        // ── Step 5: Reconcile ────────────────────────────────────────────
        let reconciliation = reconcile(document.id, &results, &ReconcileOptions::from(config));
        if reconciliation.usable_pages == 0 {
            let first_error = results
                .iter()
                .find_map(PageExtractionResult::error)
                .unwrap_or_else(|| "unknown error".to_string());
            let reason = TranscribeError::NoUsablePages { total, first_error }.to_string();
            return self
                .fail_with_fallback(&mut job, &mut document, Some(bytes), reason)
                .await;
        }

        store
            .put_page_result(&reconciliation.to_page_result(job_id))
            .await?;

        let confidence = reconciliation.combined.overall_confidence;
        job.complete(confidence)?;
        store.put_job(&job).await?;
        document.status = JobStatus::Completed;
        store.put_document(&document).await?;

        info!(
            "Job {}: completed — {}/{} usable pages, {} questions, confidence {:.2}",
            job_id,
            reconciliation.usable_pages,
            total,
            reconciliation.combined.questions.len(),
            confidence
        );
        Ok(())
    }

    /// Document-level failure: run the fallback, store its result as the
    /// page-0 record, mark job and document failed.
    async fn fail_with_fallback(
        &self,
        job: &mut ExtractionJob,
        document: &mut Document,
        bytes: Option<Vec<u8>>,
        reason: String,
    ) -> Result<(), TranscribeError> {
        warn!("Job {}: {} — running fallback extraction", job.id, reason);
        let started = Instant::now();
        let combined = self
            .inner
            .fallback
            .extract_fallback(document, bytes, &reason)
            .await;

        let record = PageExtractionResult {
            job_id: job.id,
            page_number: COMBINED_PAGE_NUMBER,
            variant: 0,
            confidence_score: combined.overall_confidence,
            content: combined.to_value(),
            processing_time: started.elapsed().as_secs_f64(),
        };
        self.inner.store.put_page_result(&record).await?;

        job.fail(reason)?;
        job.extraction_method = Some(ExtractionMethod::Fallback);
        self.inner.store.put_job(job).await?;
        document.status = JobStatus::Failed;
        self.inner.store.put_document(document).await?;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
