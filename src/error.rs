//! Error types for the dongy-extract library.
//!
//! Three layers of failure, mirroring how far a problem is allowed to travel:
//!
//! * [`DongyError`] — **Fatal**: the run cannot proceed at all (missing input
//!   document, invalid page range, provider not configured, output I/O).
//!   Returned as `Err(DongyError)` from the top-level entry points.
//!
//! * [`ChunkError`] — **Non-fatal, per sub-document**: the upload never became
//!   ready, or every window failed in a way that poisons the sub-document.
//!   Caught by the orchestrator, written into the checkpoint as `last_error`,
//!   and the run moves on to the next sub-document.
//!
//! * [`RemoteError`] — a single remote call failed. Classified exactly once
//!   (see [`RemoteErrorKind::classify`]) at the provider boundary, then
//!   consumed by the retry executor. Never escapes a slice.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the dongy-extract library.
#[derive(Debug, Error)]
pub enum DongyError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// pdfium could not open the document.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// The document has no pages to extract.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    /// A page could not be rendered to an image.
    #[error("Failed to render page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Configuration errors ──────────────────────────────────────────────
    /// Overlap must be strictly smaller than the unit it overlaps.
    #[error("Invalid page range: overlap of {overlap} pages must be smaller than {size} pages per unit")]
    InvalidRange { size: usize, overlap: usize },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// Could not read, write or remove the checkpoint file.
    #[error("Checkpoint I/O failed for '{path}': {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint exists but is not valid JSON of the expected shape.
    #[error("Checkpoint '{path}' is corrupt: {detail}\nDelete it or run with --fresh.")]
    CorruptCheckpoint { path: PathBuf, detail: String },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV serialisation failed.
    #[error("Failed to write CSV '{path}': {detail}")]
    CsvWriteFailed { path: PathBuf, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single sub-document.
///
/// Stored in the checkpoint's `last_error` field; the run continues with the
/// next sub-document.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChunkError {
    /// The remote upload never left the processing state.
    #[error("{chunk}: upload still processing after {secs}s")]
    ProcessingTimeout { chunk: String, secs: u64 },

    /// The remote side reported the upload as failed.
    #[error("{chunk}: upload failed: {detail}")]
    UploadFailed { chunk: String, detail: String },

    /// Too many consecutive windows failed; remaining windows were skipped.
    #[error("{chunk}: aborted after {failures} consecutive window failures")]
    TooManyFailures { chunk: String, failures: u32 },
}

/// Broad class of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Rate limit / quota exhausted. Retry with exponential backoff.
    QuotaExceeded,
    /// Temporary unavailability, timeouts, 5xx. Retry with exponential backoff.
    Transient,
    /// The call succeeded but the body was empty or unusable.
    Malformed,
    /// Authentication or request errors that no retry can fix.
    Fatal,
}

impl RemoteErrorKind {
    /// Classify a provider error message.
    ///
    /// Providers surface failures as free text; this is the only place that
    /// inspects that text.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        const QUOTA: [&str; 6] = [
            "429",
            "quota",
            "rate limit",
            "rate_limit",
            "resource_exhausted",
            "too many requests",
        ];
        const FATAL: [&str; 6] = [
            "401",
            "403",
            "api key",
            "api_key",
            "permission",
            "unauthorized",
        ];
        if QUOTA.iter().any(|k| m.contains(k)) {
            RemoteErrorKind::QuotaExceeded
        } else if FATAL.iter().any(|k| m.contains(k)) {
            RemoteErrorKind::Fatal
        } else {
            RemoteErrorKind::Transient
        }
    }
}

/// A failed remote call, already classified.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build from a provider message, classifying it.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: RemoteErrorKind::classify(&message),
            message,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Malformed, message)
    }
}
