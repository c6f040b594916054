//! Input resolution: turn a user-supplied path or URL into PDF bytes.
//!
//! pdfium reads from a byte slice, so URLs are downloaded straight into
//! memory. The `%PDF` magic is checked before returning so callers get a
//! meaningful error rather than a pdfium failure later.

use crate::error::TranscribeError;
use std::path::Path;
use tracing::{debug, info};

/// PDF bytes plus the filename to register them under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPdf {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Whether `bytes` start with the PDF magic.
pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Reject anything that does not start with `%PDF`.
pub fn ensure_pdf(filename: &str, bytes: &[u8]) -> Result<(), TranscribeError> {
    if has_pdf_magic(bytes) {
        Ok(())
    } else {
        Err(TranscribeError::NotAPdf {
            filename: filename.to_string(),
            magic: bytes.iter().take(4).copied().collect(),
        })
    }
}

/// Load a PDF from a local path or an HTTP(S) URL.
pub async fn load_pdf(input: &str, timeout_secs: u64) -> Result<LoadedPdf, TranscribeError> {
    let loaded = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    ensure_pdf(&loaded.filename, &loaded.bytes)?;
    Ok(loaded)
}

async fn read_local(path_str: &str) -> Result<LoadedPdf, TranscribeError> {
    let path = Path::new(path_str);
    let bytes = tokio::fs::read(path).await.map_err(|e| TranscribeError::Io {
        path: path_str.to_string(),
        source: e,
    })?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(LoadedPdf { filename, bytes })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<LoadedPdf, TranscribeError> {
    info!("Downloading PDF from: {}", url);
    let unavailable = |reason: String| TranscribeError::InputUnavailable {
        input: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| unavailable(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            unavailable(format!("timed out after {timeout_secs}s"))
        } else {
            unavailable(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(unavailable(format!("HTTP {}", response.status())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    info!("Downloaded {} bytes", bytes.len());
    Ok(LoadedPdf {
        filename: filename_from_url(url),
        bytes: bytes.to_vec(),
    })
}

/// Last path segment of the URL if it looks like a filename.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url_path() {
        assert_eq!(filename_from_url("https://x.org/forms/intake.pdf?v=2"), "intake.pdf");
        assert_eq!(filename_from_url("https://x.org/download/"), "downloaded.pdf");
    }

    #[test]
    fn magic_check() {
        assert!(ensure_pdf("a.pdf", b"%PDF-1.7\n").is_ok());
        let err = ensure_pdf("a.png", b"\x89PNG\r\n").unwrap_err();
        assert!(matches!(err, TranscribeError::NotAPdf { ref magic, .. } if magic == b"\x89PNG"));
    }

    #[tokio::test]
    async fn local_file_is_loaded_and_checked() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("form.pdf");
        std::fs::write(&good, b"%PDF-1.4 minimal").unwrap();
        let loaded = load_pdf(good.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(loaded.filename, "form.pdf");

        let bad = dir.path().join("notes.txt");
        std::fs::write(&bad, b"hello").unwrap();
        assert!(matches!(
            load_pdf(bad.to_str().unwrap(), 5).await,
            Err(TranscribeError::NotAPdf { .. })
        ));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = load_pdf("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, TranscribeError::Io { .. }));
    }
}
