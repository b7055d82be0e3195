//! Checkpoint persistence: resumability at sub-document granularity.
//!
//! The file is rewritten after every sub-document, so a crash loses at most
//! the sub-document in flight. Writes go to a sibling temp file that is then
//! renamed over the checkpoint; a reader never sees a half-written file.
//!
//! ```text
//! {
//!   "processed_chunks": ["book_part001_p1-200", ...],
//!   "all_results": {"vi_thuoc": [...], "bai_thuoc": [...], "cong_thuc": [...]},
//!   "total_processed": 1,
//!   "last_updated": "2026-10-18T09:12:44.311+00:00",
//!   "last_error": "book_part002_p171-370: upload failed: ..."
//! }
//! ```

use crate::error::DongyError;
use crate::output::AggregateResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Ids of sub-documents whose records are in `all_results`.
    #[serde(default)]
    pub processed_chunks: Vec<String>,
    #[serde(default)]
    pub all_results: AggregateResult,
    #[serde(default)]
    pub total_processed: usize,
    /// RFC 3339 timestamp of the last save.
    #[serde(default)]
    pub last_updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Checkpoint {
    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_chunks.iter().any(|p| p == id)
    }

    /// Record a finished sub-document.
    pub fn mark_processed(&mut self, id: &str) {
        if !self.is_processed(id) {
            self.processed_chunks.push(id.to_string());
        }
        self.total_processed = self.processed_chunks.len();
    }
}

/// Location of one document's checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{dir}/{stem}.checkpoint.json`
    pub fn for_document(dir: &Path, stem: &str) -> Self {
        Self::new(dir.join(format!("{}.checkpoint.json", stem)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored checkpoint, or `None` when there is none.
    pub async fn load(&self) -> Result<Option<Checkpoint>, DongyError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| DongyError::CorruptCheckpoint {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;
        info!(
            "Loaded checkpoint {}: {} sub-documents done",
            self.path.display(),
            checkpoint.processed_chunks.len()
        );
        Ok(Some(checkpoint))
    }

    /// Stamp `last_updated` and write atomically.
    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), DongyError> {
        checkpoint.last_updated = chrono::Utc::now().to_rfc3339();
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| DongyError::Internal(format!("checkpoint serialisation: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        debug!("Checkpoint saved: {}", self.path.display());
        Ok(())
    }

    /// Delete the checkpoint. A missing file is not an error.
    pub async fn clear(&self) -> Result<(), DongyError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Checkpoint cleared: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> DongyError {
        DongyError::Checkpoint {
            path: self.path.clone(),
            source,
        }
    }
}
