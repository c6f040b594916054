//! Persistence sink for documents, jobs and page results.
//!
//! The orchestrator only talks to the [`ExtractionStore`] trait. Two
//! implementations ship with the crate:
//!
//! * [`MemoryStore`] — process-local maps, the default for the library and CLI.
//! * [`FsStore`] — one JSON file per record under a root directory, written
//!   atomically (temp file + rename) so a crash never leaves half a record.
//!
//! Page results are write-once: a second write for the same
//! `(job, page_number, variant)` is rejected.

use crate::error::TranscribeError;
use crate::model::{Document, ExtractionJob, PageExtractionResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// get/list/upsert of the core's records.
#[async_trait]
pub trait ExtractionStore: Send + Sync {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, TranscribeError>;

    async fn put_document(&self, document: &Document) -> Result<(), TranscribeError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ExtractionJob>, TranscribeError>;

    async fn put_job(&self, job: &ExtractionJob) -> Result<(), TranscribeError>;

    /// All jobs of a document, newest first.
    async fn list_jobs(&self, document_id: Uuid) -> Result<Vec<ExtractionJob>, TranscribeError>;

    /// Append a page result. Fails if this `(job, page, variant)` exists.
    async fn put_page_result(&self, result: &PageExtractionResult) -> Result<(), TranscribeError>;

    /// All page results of a job ordered by page number then variant;
    /// the page-0 combined record, if any, comes first.
    async fn list_page_results(&self, job_id: Uuid)
        -> Result<Vec<PageExtractionResult>, TranscribeError>;
}

fn newest_first(jobs: &mut [ExtractionJob]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

fn duplicate_page(result: &PageExtractionResult) -> TranscribeError {
    TranscribeError::Storage(format!(
        "page {} (variant {}) of job {} is already stored",
        result.page_number, result.variant, result.job_id
    ))
}

// ── In-memory store ──────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<Uuid, Document>,
    jobs: HashMap<Uuid, ExtractionJob>,
    pages: BTreeMap<(Uuid, usize, usize), PageExtractionResult>,
}

/// Process-local store. The lock is never held across an `.await`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, TranscribeError> {
        self.inner
            .lock()
            .map_err(|_| TranscribeError::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, TranscribeError> {
        Ok(self.lock()?.documents.get(&id).cloned())
    }

    async fn put_document(&self, document: &Document) -> Result<(), TranscribeError> {
        self.lock()?.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ExtractionJob>, TranscribeError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn put_job(&self, job: &ExtractionJob) -> Result<(), TranscribeError> {
        self.lock()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_jobs(&self, document_id: Uuid) -> Result<Vec<ExtractionJob>, TranscribeError> {
        let mut jobs: Vec<ExtractionJob> = self
            .lock()?
            .jobs
            .values()
            .filter(|j| j.document_id == document_id)
            .cloned()
            .collect();
        newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn put_page_result(&self, result: &PageExtractionResult) -> Result<(), TranscribeError> {
        let mut inner = self.lock()?;
        let key = (result.job_id, result.page_number, result.variant);
        if inner.pages.contains_key(&key) {
            return Err(duplicate_page(result));
        }
        inner.pages.insert(key, result.clone());
        Ok(())
    }

    async fn list_page_results(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PageExtractionResult>, TranscribeError> {
        Ok(self
            .lock()?
            .pages
            .range((job_id, 0, 0)..=(job_id, usize::MAX, usize::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }
}

// ── JSON directory store ─────────────────────────────────────────────────

/// One JSON file per record:
///
/// ```text
/// <root>/documents/<id>.json
/// <root>/jobs/<id>.json
/// <root>/pages/<job id>/<page>-<variant>.json
/// ```
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, TranscribeError> {
        let root = root.into();
        for sub in ["documents", "jobs", "pages"] {
            let dir = root.join(sub);
            tokio::fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, id: Uuid) -> PathBuf {
        self.root.join("documents").join(format!("{id}.json"))
    }

    fn job_path(&self, id: Uuid) -> PathBuf {
        self.root.join("jobs").join(format!("{id}.json"))
    }

    fn page_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join("pages").join(job_id.to_string())
    }

    fn page_path(&self, result: &PageExtractionResult) -> PathBuf {
        self.page_dir(result.job_id)
            .join(format!("{}-{}.json", result.page_number, result.variant))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> TranscribeError {
    TranscribeError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, TranscribeError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            TranscribeError::Storage(format!("corrupt record {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Write via a sibling temp file and rename.
async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), TranscribeError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| TranscribeError::Storage(format!("serialise {}: {e}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_err(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_err(path, e))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Every `*.json` record in `dir`, skipping unreadable files.
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, TranscribeError> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(io_err(dir, e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(dir, e))? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path).await {
            Ok(Some(v)) => out.push(v),
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(out)
}

#[async_trait]
impl ExtractionStore for FsStore {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, TranscribeError> {
        read_json(&self.document_path(id)).await
    }

    async fn put_document(&self, document: &Document) -> Result<(), TranscribeError> {
        write_json(&self.document_path(document.id), document).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ExtractionJob>, TranscribeError> {
        read_json(&self.job_path(id)).await
    }

    async fn put_job(&self, job: &ExtractionJob) -> Result<(), TranscribeError> {
        write_json(&self.job_path(job.id), job).await
    }

    async fn list_jobs(&self, document_id: Uuid) -> Result<Vec<ExtractionJob>, TranscribeError> {
        let mut jobs: Vec<ExtractionJob> = read_all(&self.root.join("jobs"))
            .await?
            .into_iter()
            .filter(|j: &ExtractionJob| j.document_id == document_id)
            .collect();
        newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn put_page_result(&self, result: &PageExtractionResult) -> Result<(), TranscribeError> {
        let dir = self.page_dir(result.job_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        let path = self.page_path(result);
        if tokio::fs::try_exists(&path).await.map_err(|e| io_err(&path, e))? {
            return Err(duplicate_page(result));
        }
        write_json(&path, result).await
    }

    async fn list_page_results(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PageExtractionResult>, TranscribeError> {
        let mut results: Vec<PageExtractionResult> = read_all(&self.page_dir(job_id)).await?;
        results.sort_by_key(|r| (r.page_number, r.variant));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(job_id: Uuid, page_number: usize, variant: usize) -> PageExtractionResult {
        PageExtractionResult {
            job_id,
            page_number,
            variant,
            content: json!({"questions": []}),
            processing_time: 0.1,
            confidence_score: 0.8,
        }
    }

    async fn exercise(store: &dyn ExtractionStore) {
        let doc = Document::new("form.pdf", 42);
        store.put_document(&doc).await.unwrap();
        assert_eq!(store.get_document(doc.id).await.unwrap(), Some(doc.clone()));
        assert_eq!(store.get_document(Uuid::new_v4()).await.unwrap(), None);

        let older = ExtractionJob::new(Uuid::new_v4(), doc.id, "m");
        let mut newer = ExtractionJob::new(Uuid::new_v4(), doc.id, "m");
        newer.created_at = older.created_at + chrono::Duration::seconds(5);
        store.put_job(&older).await.unwrap();
        store.put_job(&newer).await.unwrap();
        store
            .put_job(&ExtractionJob::new(Uuid::new_v4(), Uuid::new_v4(), "m"))
            .await
            .unwrap();

        let jobs = store.list_jobs(doc.id).await.unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![newer.id, older.id]);

        store.put_page_result(&page(newer.id, 2, 0)).await.unwrap();
        store.put_page_result(&page(newer.id, 1, 1)).await.unwrap();
        store.put_page_result(&page(newer.id, 1, 0)).await.unwrap();
        store.put_page_result(&page(older.id, 1, 0)).await.unwrap();

        let err = store.put_page_result(&page(newer.id, 2, 0)).await.unwrap_err();
        assert!(matches!(err, TranscribeError::Storage(_)));

        let order: Vec<(usize, usize)> = store
            .list_page_results(newer.id)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.page_number, r.variant))
            .collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0)]);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::new("form.pdf", 1);
        FsStore::open(dir.path()).await.unwrap().put_document(&doc).await.unwrap();

        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get_document(doc.id).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn fs_store_reports_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        std::fs::write(store.job_path(id), b"{not json").unwrap();
        assert!(matches!(store.get_job(id).await, Err(TranscribeError::Storage(_))));
    }
}
