//! Progress-callback trait for per-chunk extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the orchestrator walks the sub-documents of a book.
//!
//! # Example
//!
//! ```rust
//! use dongy_extract::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_chunk_complete(&self, index: usize, total: usize, records: usize) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("chunk {}/{}: {} records", index + 1, total, records);
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { done: AtomicUsize::new(0) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(cb as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it processes a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Chunk indices are 0-based; `total` is the number of
/// sub-documents in the document, including ones skipped on resume.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after the document has been split.
    ///
    /// `already_done` is the number of sub-documents a checkpoint marked as
    /// processed; they will not be revisited.
    fn on_run_start(&self, total_chunks: usize, already_done: usize) {
        let _ = (total_chunks, already_done);
    }

    /// Called before a sub-document is uploaded.
    fn on_chunk_start(&self, index: usize, total: usize, start_page: usize, end_page: usize) {
        let _ = (index, total, start_page, end_page);
    }

    /// Called after each page window reaches a terminal state.
    ///
    /// `state` is the lowercase state name (`accepted`, `too_short`, …).
    fn on_slice_complete(&self, start_page: usize, end_page: usize, state: &str) {
        let _ = (start_page, end_page, state);
    }

    /// Called when a sub-document finished and was checkpointed.
    fn on_chunk_complete(&self, index: usize, total: usize, records: usize) {
        let _ = (index, total, records);
    }

    /// Called when a sub-document failed; the run continues.
    fn on_chunk_error(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Called once after dedup and persistence.
    fn on_run_complete(&self, successful_chunks: usize, failed_chunks: usize) {
        let _ = (successful_chunks, failed_chunks);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
