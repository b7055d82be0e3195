//! # dongy-extract
//!
//! Extract herbs (*vị thuốc*), prescriptions (*bài thuốc*) and formula lines
//! (*công thức*) from large scanned Vietnamese traditional-medicine books
//! using a remote vision LLM.
//!
//! ## Why this crate?
//!
//! A 1 000-page scan does not fit in one request, free-tier quotas allow a
//! handful of calls per minute, and vision models occasionally fall into
//! repetition loops or return nothing. Runs take hours and must survive
//! being interrupted. This crate wraps the model calls in a sequential,
//! rate-limited, retrying pipeline that checkpoints after every
//! sub-document and merges duplicate records once at the end.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input       resolve local file or download from URL
//!  ├─ 2. Split       overlapping sub-documents → overlapping page windows
//!  ├─ 3. Slices      OCR each window (quality gate, fallback model, retries)
//!  ├─ 4. Structured  JSON records per slice, validated with defaults
//!  ├─ 5. Dedup       merge records describing the same herb / prescription
//!  └─ 6. Output      thuoc_dong_y.json + three CSV tables
//! ```
//!
//! Progress is checkpointed per sub-document; rerunning the same document
//! resumes where the previous run stopped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dongy_extract::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider from GEMINI_API_KEY / EDGEQUAKE_LLM_PROVIDER / auto-detection
//!     let config = ExtractionConfig::builder()
//!         .output_dir("data/processed")
//!         .build()?;
//!     let summary = extract("data/raw/cay_thuoc.pdf", &config).await?;
//!     eprintln!(
//!         "{} herbs, {} prescriptions ({} sub-documents failed)",
//!         summary.final_counts.herbs,
//!         summary.final_counts.prescriptions,
//!         summary.failed_chunks
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Custom backends
//!
//! Every remote call goes through [`RemoteModel`]. Implement it to target a
//! service with a real document store, or to script responses in tests, and
//! drive it with [`Extractor`]; results go to any [`ResultSink`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `dongy` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, MergePolicy, NO_INFO};
pub use error::{ChunkError, DongyError, RemoteError, RemoteErrorKind};
pub use extract::{extract, extract_sync, Extractor};
pub use output::{
    AggregateResult, ChunkInfo, ExtractionResult, FormulaLine, Herb, Prescription, RecordCounts,
    RunSummary,
};
pub use pipeline::checkpoint::{Checkpoint, CheckpointStore};
pub use pipeline::dedup::{DedupReport, Deduplicator};
pub use pipeline::llm::EdgequakeModel;
pub use pipeline::persist::{FileSink, ResultSink};
pub use pipeline::remote::{
    GenerateOptions, GenerateRequest, RemoteHandle, RemoteInput, RemoteModel, RemoteResponse,
    ResponseFormat, UploadState,
};
pub use pipeline::split::{Document, PageWindow, SubDocument};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
