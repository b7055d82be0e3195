//! Source resolution: a local path or an `http(s)` URL becomes a readable
//! PDF on disk.
//!
//! pdfium only opens files, so a URL is downloaded into a [`TempDir`] that
//! lives as long as the [`SourcePdf`]. Both branches check the `%PDF` magic
//! before anything is rendered.

use crate::error::DongyError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";
const FALLBACK_FILENAME: &str = "downloaded.pdf";

/// A PDF ready to be opened from disk.
#[derive(Debug)]
pub enum SourcePdf {
    Local(PathBuf),
    /// Downloaded copy; deleted with the temp dir on drop.
    Downloaded { path: PathBuf, _dir: TempDir },
}

impl SourcePdf {
    pub fn path(&self) -> &Path {
        match self {
            SourcePdf::Local(path) => path,
            SourcePdf::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a local PDF, downloading URLs within `timeout_secs`.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<SourcePdf, DongyError> {
    if is_url(input) {
        download(input, timeout_secs).await
    } else {
        open_local(PathBuf::from(input))
    }
}

fn open_local(path: PathBuf) -> Result<SourcePdf, DongyError> {
    if !path.is_file() {
        return Err(DongyError::FileNotFound { path });
    }
    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DongyError::PermissionDenied { path })
        }
        Err(_) => return Err(DongyError::FileNotFound { path }),
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_ok() {
        check_magic(&path, magic)?;
    }
    debug!("Local source: {}", path.display());
    Ok(SourcePdf::Local(path))
}

fn check_magic(path: &Path, magic: [u8; 4]) -> Result<(), DongyError> {
    if &magic == PDF_MAGIC {
        Ok(())
    } else {
        Err(DongyError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        })
    }
}

async fn download(url: &str, timeout_secs: u64) -> Result<SourcePdf, DongyError> {
    info!("Downloading {}", url);
    let failed = |reason: String| DongyError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DongyError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    let dir = TempDir::new().map_err(|e| DongyError::Internal(e.to_string()))?;
    let path = dir.path().join(filename_from_url(url));

    if bytes.len() >= 4 {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        check_magic(&path, magic)?;
    }
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| DongyError::Internal(format!("Failed to write download: {}", e)))?;

    info!("Downloaded {} bytes to {}", bytes.len(), path.display());
    Ok(SourcePdf::Downloaded { path, _dir: dir })
}

/// Last path segment of `url` when it looks like a file name.
///
/// The stem names checkpoints and sub-documents, so keeping it stable across
/// runs matters for resuming URL inputs.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection() {
        assert!(is_url("https://thuvien.example/duoc_lieu.pdf"));
        assert!(is_url("http://thuvien.example/duoc_lieu.pdf"));
        assert!(!is_url("data/raw/duoc_lieu.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_is_taken_from_last_segment() {
        assert_eq!(
            filename_from_url("https://thuvien.example/sach/cay_thuoc.pdf?v=2"),
            "cay_thuoc.pdf"
        );
        assert_eq!(filename_from_url("https://thuvien.example/"), FALLBACK_FILENAME);
        assert_eq!(filename_from_url("https://thuvien.example/sach"), FALLBACK_FILENAME);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = resolve_input("/no/such/sach.pdf", 5).await.unwrap_err();
        assert!(matches!(err, DongyError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn non_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, b"PK\x03\x04zip").unwrap();
        let err = resolve_input(path.to_str().unwrap(), 5).await.unwrap_err();
        assert!(matches!(err, DongyError::NotAPdf { magic, .. } if &magic == b"PK\x03\x04"));
    }

    #[tokio::test]
    async fn pdf_magic_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sach.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let source = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(source.path(), path.as_path());
    }
}
