//! Configuration types for an extraction run.
//!
//! Every knob lives in [`ExtractionConfig`], built via
//! [`ExtractionConfigBuilder`]. Defaults match the settings the pipeline was
//! tuned with on free-tier Gemini quotas (15 requests/minute); loading them
//! from flags or the environment is the binary's job, not the library's.

use crate::error::DongyError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Sentinel stored in every attribute field the model had nothing to say about.
pub const NO_INFO: &str = "Không có thông tin";

/// Configuration for an extraction run.
///
/// # Example
/// ```rust
/// use dongy_extract::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .pages_per_chunk(100)
///     .overlap_pages(10)
///     .requests_per_minute(30)
///     .build()
///     .unwrap();
/// assert_eq!(config.pages_per_chunk, 100);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    // ── Page chunking ────────────────────────────────────────────────────
    /// Pages per uploaded sub-document. Default: 200.
    ///
    /// Upload limits on the remote side cap how large one document may be;
    /// 200 scanned pages stays comfortably under them.
    pub pages_per_chunk: usize,

    /// Pages shared by neighbouring sub-documents. Default: 30.
    pub overlap_pages: usize,

    /// Pages transcribed per OCR request. Default: 7.
    ///
    /// Larger windows hit the output-token ceiling and get truncated.
    pub pages_per_request: usize,

    /// Pages shared by neighbouring OCR windows. Default: 3.
    ///
    /// Entries often straddle a page break; overlap lets at least one window
    /// see each entry whole. The resulting duplicates are removed by the
    /// terminal dedup pass.
    pub request_overlap_pages: usize,

    // ── Models ───────────────────────────────────────────────────────────
    /// LLM provider name (e.g. "gemini", "openai"). If None, auto-detected.
    pub provider_name: Option<String>,

    /// Vision model used for page transcription.
    pub ocr_model: String,

    /// Model retried once when the OCR model returns too little text.
    /// `None` disables the fallback.
    pub fallback_model: Option<String>,

    /// Text model used for JSON extraction.
    pub text_model: String,

    /// Maximum tokens the model may generate per call. Default: 8192.
    pub max_output_tokens: usize,

    // ── Request limitation ───────────────────────────────────────────────
    /// Maximum remote calls in any rolling 60 s window. Default: 15.
    pub requests_per_minute: usize,

    /// Minimum spacing between two consecutive calls. Default: 4.5 s.
    pub min_request_delay: Duration,

    /// Retries after the first attempt. Default: 5.
    pub max_retries: u32,

    /// First quota/transient backoff. Default: 3 s.
    pub initial_backoff: Duration,

    /// Growth factor per attempt. Default: 1.5.
    pub backoff_multiplier: f64,

    /// Backoff ceiling before jitter. Default: 120 s.
    pub max_backoff: Duration,

    /// Fixed delay after malformed or low-quality responses. Default: 2 s.
    pub retry_delay: Duration,

    /// Consecutive failed windows that abort a sub-document. Default: 3.
    pub max_consecutive_failures: u32,

    /// Wall-clock bound for an upload to become ready. Default: 300 s.
    pub upload_timeout: Duration,

    /// How often upload state is polled. Default: 2 s.
    pub upload_poll_interval: Duration,

    // ── Quality gate ─────────────────────────────────────────────────────
    /// Transcriptions shorter than this many characters are "too short". Default: 100.
    pub min_ocr_length: usize,

    /// Retry short transcriptions once on `fallback_model`. Default: true.
    pub retry_with_fallback: bool,

    /// Adjacent-block similarity above which text is repetitive. Default: 0.6.
    pub repetition_threshold: f64,

    /// Repetition is only judged on texts at least this long. Default: 200.
    pub repetition_min_chars: usize,

    /// Repetition is only judged on texts with at least this many words. Default: 30.
    pub repetition_min_words: usize,

    /// Temperature increase per structured-extraction retry. Default: 0.1.
    pub structured_temperature_step: f32,

    /// Highest temperature a structured-extraction retry may use. Default: 0.4.
    pub structured_temperature_cap: f32,

    // ── Deduplication ────────────────────────────────────────────────────
    /// Fuzzy name similarity that counts as the same herb. Default: 0.85.
    pub similarity_threshold: f64,

    /// Enable the fuzzy herb-name pass. Default: true.
    pub use_fuzzy_matching: bool,

    /// How two differing, informative field values are reconciled.
    pub merge_policy: MergePolicy,

    // ── Run control & paths ──────────────────────────────────────────────
    /// Resume from an existing checkpoint. Default: true.
    pub resume: bool,

    /// Directory for the JSON and CSV exports. Default: `data/processed`.
    pub output_dir: PathBuf,

    /// Directory for checkpoint files. Default: `data/checkpoints`.
    pub checkpoint_dir: PathBuf,

    /// Rendering DPI used when rasterising pages for upload. Default: 150.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            pages_per_chunk: 200,
            overlap_pages: 30,
            pages_per_request: 7,
            request_overlap_pages: 3,
            provider_name: None,
            ocr_model: "gemini-2.0-flash".to_string(),
            fallback_model: Some("gemini-2.0-flash-lite".to_string()),
            text_model: "gemini-2.5-flash-lite".to_string(),
            max_output_tokens: 8192,
            requests_per_minute: 15,
            min_request_delay: Duration::from_millis(4500),
            max_retries: 5,
            initial_backoff: Duration::from_secs(3),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_secs(120),
            retry_delay: Duration::from_secs(2),
            max_consecutive_failures: 3,
            upload_timeout: Duration::from_secs(300),
            upload_poll_interval: Duration::from_secs(2),
            min_ocr_length: 100,
            retry_with_fallback: true,
            repetition_threshold: 0.6,
            repetition_min_chars: 200,
            repetition_min_words: 30,
            structured_temperature_step: 0.1,
            structured_temperature_cap: 0.4,
            similarity_threshold: 0.85,
            use_fuzzy_matching: true,
            merge_policy: MergePolicy::default(),
            resume: true,
            output_dir: PathBuf::from("data/processed"),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            dpi: 150,
            max_rendered_pixels: 2000,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("pages_per_chunk", &self.pages_per_chunk)
            .field("overlap_pages", &self.overlap_pages)
            .field("pages_per_request", &self.pages_per_request)
            .field("request_overlap_pages", &self.request_overlap_pages)
            .field("provider_name", &self.provider_name)
            .field("ocr_model", &self.ocr_model)
            .field("fallback_model", &self.fallback_model)
            .field("text_model", &self.text_model)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("min_request_delay", &self.min_request_delay)
            .field("max_retries", &self.max_retries)
            .field("similarity_threshold", &self.similarity_threshold)
            .field("use_fuzzy_matching", &self.use_fuzzy_matching)
            .field("merge_policy", &self.merge_policy)
            .field("resume", &self.resume)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The fallback model, if the fallback is enabled.
    pub fn active_fallback(&self) -> Option<&str> {
        if self.retry_with_fallback {
            self.fallback_model.as_deref()
        } else {
            None
        }
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn pages_per_chunk(mut self, n: usize) -> Self {
        self.config.pages_per_chunk = n;
        self
    }

    pub fn overlap_pages(mut self, n: usize) -> Self {
        self.config.overlap_pages = n;
        self
    }

    pub fn pages_per_request(mut self, n: usize) -> Self {
        self.config.pages_per_request = n;
        self
    }

    pub fn request_overlap_pages(mut self, n: usize) -> Self {
        self.config.request_overlap_pages = n;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn ocr_model(mut self, model: impl Into<String>) -> Self {
        self.config.ocr_model = model.into();
        self
    }

    pub fn fallback_model(mut self, model: Option<String>) -> Self {
        self.config.fallback_model = model;
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = model.into();
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = n.max(1);
        self
    }

    pub fn requests_per_minute(mut self, n: usize) -> Self {
        self.config.requests_per_minute = n.max(1);
        self
    }

    pub fn min_request_delay(mut self, d: Duration) -> Self {
        self.config.min_request_delay = d;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn initial_backoff(mut self, d: Duration) -> Self {
        self.config.initial_backoff = d;
        self
    }

    pub fn backoff_multiplier(mut self, m: f64) -> Self {
        self.config.backoff_multiplier = m.max(1.0);
        self
    }

    pub fn max_backoff(mut self, d: Duration) -> Self {
        self.config.max_backoff = d;
        self
    }

    pub fn retry_delay(mut self, d: Duration) -> Self {
        self.config.retry_delay = d;
        self
    }

    pub fn max_consecutive_failures(mut self, n: u32) -> Self {
        self.config.max_consecutive_failures = n.max(1);
        self
    }

    pub fn upload_timeout(mut self, d: Duration) -> Self {
        self.config.upload_timeout = d;
        self
    }

    pub fn upload_poll_interval(mut self, d: Duration) -> Self {
        self.config.upload_poll_interval = d;
        self
    }

    pub fn min_ocr_length(mut self, n: usize) -> Self {
        self.config.min_ocr_length = n;
        self
    }

    pub fn retry_with_fallback(mut self, v: bool) -> Self {
        self.config.retry_with_fallback = v;
        self
    }

    pub fn repetition_threshold(mut self, t: f64) -> Self {
        self.config.repetition_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn repetition_min_chars(mut self, n: usize) -> Self {
        self.config.repetition_min_chars = n;
        self
    }

    pub fn repetition_min_words(mut self, n: usize) -> Self {
        self.config.repetition_min_words = n;
        self
    }

    pub fn structured_temperature_step(mut self, t: f32) -> Self {
        self.config.structured_temperature_step = t.max(0.0);
        self
    }

    pub fn structured_temperature_cap(mut self, t: f32) -> Self {
        self.config.structured_temperature_cap = t.clamp(0.0, 2.0);
        self
    }

    pub fn similarity_threshold(mut self, t: f64) -> Self {
        self.config.similarity_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn use_fuzzy_matching(mut self, v: bool) -> Self {
        self.config.use_fuzzy_matching = v;
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config.merge_policy = policy;
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// Overlaps are checked here so a bad configuration fails before any
    /// remote call is made.
    pub fn build(self) -> Result<ExtractionConfig, DongyError> {
        let c = &self.config;
        if c.pages_per_chunk == 0 || c.overlap_pages >= c.pages_per_chunk {
            return Err(DongyError::InvalidRange {
                size: c.pages_per_chunk,
                overlap: c.overlap_pages,
            });
        }
        if c.pages_per_request == 0 || c.request_overlap_pages >= c.pages_per_request {
            return Err(DongyError::InvalidRange {
                size: c.pages_per_request,
                overlap: c.request_overlap_pages,
            });
        }
        if c.pages_per_request > c.pages_per_chunk {
            return Err(DongyError::InvalidConfig(format!(
                "pages per request ({}) exceeds pages per chunk ({})",
                c.pages_per_request, c.pages_per_chunk
            )));
        }
        if c.ocr_model.trim().is_empty() || c.text_model.trim().is_empty() {
            return Err(DongyError::InvalidConfig(
                "OCR and text model names must not be empty".into(),
            ));
        }
        if c.max_backoff < c.initial_backoff {
            return Err(DongyError::InvalidConfig(format!(
                "max backoff {:?} is below initial backoff {:?}",
                c.max_backoff, c.initial_backoff
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the merger reconciles two informative values that disagree.
///
/// `PreferLonger` assumes more characters carry more information. That holds
/// for truncated OCR windows but can favour a verbose wrong value over a
/// terse correct one, so it is a policy rather than a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// The longer value wins; ties keep the existing value. (default)
    #[default]
    PreferLonger,
    /// The first value seen wins; incoming values only fill gaps.
    KeepExisting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let c = ExtractionConfig::builder().build().expect("defaults are valid");
        assert_eq!(c.pages_per_chunk, 200);
        assert_eq!(c.overlap_pages, 30);
        assert_eq!(c.requests_per_minute, 15);
        assert_eq!(c.min_request_delay, Duration::from_millis(4500));
        assert_eq!(c.active_fallback(), Some("gemini-2.0-flash-lite"));
    }

    #[test]
    fn overlap_equal_to_chunk_is_rejected() {
        let err = ExtractionConfig::builder()
            .pages_per_chunk(6)
            .overlap_pages(6)
            .build()
            .unwrap_err();
        assert!(matches!(err, DongyError::InvalidRange { size: 6, overlap: 6 }));
    }

    #[test]
    fn request_overlap_is_validated() {
        let err = ExtractionConfig::builder()
            .pages_per_request(3)
            .request_overlap_pages(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, DongyError::InvalidRange { .. }));
    }

    #[test]
    fn fallback_can_be_disabled() {
        let c = ExtractionConfig::builder()
            .retry_with_fallback(false)
            .build()
            .unwrap();
        assert_eq!(c.active_fallback(), None);
    }

    #[test]
    fn thresholds_are_clamped() {
        let c = ExtractionConfig::builder()
            .similarity_threshold(3.0)
            .repetition_threshold(-1.0)
            .build()
            .unwrap();
        assert_eq!(c.similarity_threshold, 1.0);
        assert_eq!(c.repetition_threshold, 0.0);
    }
}
