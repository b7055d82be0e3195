//! Pipeline stages for chunked extraction.
//!
//! Each submodule owns one step; the orchestration lives in
//! [`crate::extract`].
//!
//! ## Data Flow
//!
//! ```text
//! input ─▶ split ─▶ slice ─────────────▶ structured ─▶ dedup ─▶ persist
//! (path)   (pages)  (upload, OCR windows)  (JSON)        (merge)   (JSON+CSV)
//!                     │                      │
//!                     └── rate ─ retry ─ backoff ── remote ◀── llm
//! ```
//!
//! 1. [`input`]: resolve the path or URL to a local PDF.
//! 2. [`split`]: cut the page range into overlapping sub-documents and each
//!    sub-document into overlapping OCR windows.
//! 3. [`slice`]: upload a sub-document and transcribe it window by window,
//!    gated by [`quality`] and deduplicated by fingerprint in [`state`].
//! 4. [`structured`]: turn each accepted slice into validated records.
//! 5. [`dedup`]: merge records that describe the same entity.
//! 6. [`persist`] and [`checkpoint`]: exports and resumable progress.
//!
//! Every remote call goes through [`rate`], [`retry`] and [`backoff`], and
//! reaches the provider through the [`remote::RemoteModel`] seam. [`llm`]
//! implements that seam over `edgequake-llm`, rendering pages with
//! [`render`] and [`encode`] only when a window is transcribed.

pub mod backoff;
pub mod checkpoint;
pub mod dedup;
pub mod encode;
pub mod input;
pub mod llm;
pub mod persist;
pub mod postprocess;
pub mod quality;
pub mod rate;
pub mod remote;
pub mod render;
pub mod retry;
pub mod slice;
pub mod split;
pub mod state;
pub mod structured;

#[cfg(test)]
pub(crate) mod testing;
