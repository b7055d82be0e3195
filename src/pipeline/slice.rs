//! Slice extraction: page windows of an uploaded sub-document → text.
//!
//! Each window moves through
//! `Pending → Uploaded → Extracting → {Accepted, TooShort, Repetitive, Failed}`.
//!
//! * A short transcription gets exactly one extra call on the fallback model;
//!   the longer of the two texts is kept. Still short means `TooShort`, which
//!   is terminal.
//! * A repetitive transcription is retried on the same model within the
//!   retry budget.
//! * Remote errors retry per [`RetryClass::for_remote`].
//! * `max_consecutive_failures` failed or repetitive windows in a row abort
//!   the rest of the sub-document (revoked keys and exhausted daily quotas
//!   look exactly like that).

use super::backoff::{BackoffPolicy, RetryClass};
use super::postprocess::clean_ocr_text;
use super::quality::{fingerprint, Quality, QualityGate};
use super::rate::RateLimiter;
use super::remote::{
    GenerateOptions, GenerateRequest, RemoteHandle, RemoteInput, RemoteModel, ResponseFormat,
    UploadState,
};
use super::retry::retry_call;
use super::split::{PageWindow, SubDocument};
use super::state::RunState;
use crate::config::ExtractionConfig;
use crate::error::{ChunkError, RemoteError, RemoteErrorKind};
use crate::prompts::{ocr_page_prompt, OCR_SYSTEM_PROMPT, STOP_MARKER};
use std::path::Path;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of one page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceState {
    Pending,
    Uploaded,
    Extracting,
    Accepted,
    TooShort,
    Repetitive,
    Failed,
}

impl SliceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceState::Pending => "pending",
            SliceState::Uploaded => "uploaded",
            SliceState::Extracting => "extracting",
            SliceState::Accepted => "accepted",
            SliceState::TooShort => "too_short",
            SliceState::Repetitive => "repetitive",
            SliceState::Failed => "failed",
        }
    }

    /// Counts toward the consecutive-failure guard.
    pub fn is_failure(&self) -> bool {
        matches!(self, SliceState::Repetitive | SliceState::Failed)
    }
}

/// An accepted, cleaned transcription of one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSlice {
    pub start_page: usize,
    pub end_page: usize,
    pub position: usize,
    pub text: String,
    pub fingerprint: String,
}

/// Terminal result of one window.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    Accepted(String),
    TooShort { chars: usize },
    Repetitive { attempts: u32 },
    Failed { reason: String },
}

impl WindowOutcome {
    pub fn state(&self) -> SliceState {
        match self {
            WindowOutcome::Accepted(_) => SliceState::Accepted,
            WindowOutcome::TooShort { .. } => SliceState::TooShort,
            WindowOutcome::Repetitive { .. } => SliceState::Repetitive,
            WindowOutcome::Failed { .. } => SliceState::Failed,
        }
    }
}

/// What slice extraction produced for one sub-document.
#[derive(Debug, Default)]
pub struct SliceReport {
    /// New (non-duplicate) accepted slices, in page order.
    pub slices: Vec<TextSlice>,
    /// Terminal state of every window attempted.
    pub outcomes: Vec<(PageWindow, SliceState)>,
    /// Set when the sub-document could not be finished.
    pub error: Option<ChunkError>,
}

#[derive(Debug, Error)]
enum WindowError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("repetitive output (similarity {score:.2})")]
    Repetitive { score: f64 },
}

impl WindowError {
    fn retry_class(&self) -> RetryClass {
        match self {
            WindowError::Remote(e) => RetryClass::for_remote(e.kind),
            WindowError::Repetitive { .. } => RetryClass::Quick,
        }
    }
}

/// Text of one attempt, before the retry loop decides.
enum Draft {
    Full(String),
    Short(String),
}

/// Transcribes the page windows of sub-documents.
pub struct SliceExtractor<'a, M: RemoteModel> {
    model: &'a M,
    config: &'a ExtractionConfig,
    limiter: &'a RateLimiter,
    policy: &'a BackoffPolicy,
    gate: QualityGate,
}

impl<'a, M: RemoteModel> SliceExtractor<'a, M> {
    pub fn new(
        model: &'a M,
        config: &'a ExtractionConfig,
        limiter: &'a RateLimiter,
        policy: &'a BackoffPolicy,
    ) -> Self {
        Self {
            model,
            config,
            limiter,
            policy,
            gate: QualityGate::from_config(config),
        }
    }

    /// Upload `sub`, transcribe `windows` in order, release the upload.
    ///
    /// Never fails outright: upload problems and the consecutive-failure
    /// guard are reported through [`SliceReport::error`], alongside whatever
    /// slices were accepted before that point.
    pub async fn extract(
        &self,
        source: &Path,
        sub: &SubDocument,
        windows: &[PageWindow],
        state: &mut RunState,
    ) -> SliceReport {
        state.begin_sub_document();
        let mut report = SliceReport::default();
        debug!("{}: {} windows {}", sub.id, windows.len(), SliceState::Pending.as_str());

        let handle = match self.upload(source, sub).await {
            Ok(handle) => handle,
            Err(e) => {
                report.error = Some(e);
                return report;
            }
        };
        if let Err(e) = self.wait_until_ready(sub, &handle).await {
            self.model.release(&handle).await;
            report.error = Some(e);
            return report;
        }
        debug!("{}: {}", sub.id, SliceState::Uploaded.as_str());

        for window in windows {
            debug!(
                "{}: p{}-{} {}",
                sub.id,
                window.start_page,
                window.end_page,
                SliceState::Extracting.as_str()
            );
            let outcome = self.extract_window(&handle, *window).await;
            let slice_state = outcome.state();
            let mut label = slice_state.as_str();

            match outcome {
                WindowOutcome::Accepted(text) => {
                    let fp = fingerprint(&text);
                    if state.remember(&fp) {
                        state.counters.accepted += 1;
                        report.slices.push(TextSlice {
                            start_page: window.start_page,
                            end_page: window.end_page,
                            position: window.position,
                            text,
                            fingerprint: fp,
                        });
                    } else {
                        debug!(
                            "{}: p{}-{} duplicates an earlier window, skipped",
                            sub.id, window.start_page, window.end_page
                        );
                        state.counters.duplicates += 1;
                        label = "duplicate";
                    }
                }
                WindowOutcome::TooShort { chars } => {
                    info!(
                        "{}: p{}-{} too short ({} chars), skipped",
                        sub.id, window.start_page, window.end_page, chars
                    );
                    state.counters.too_short += 1;
                }
                WindowOutcome::Repetitive { attempts } => {
                    warn!(
                        "{}: p{}-{} still repetitive after {} attempt(s)",
                        sub.id, window.start_page, window.end_page, attempts
                    );
                    state.counters.repetitive += 1;
                }
                WindowOutcome::Failed { reason } => {
                    warn!(
                        "{}: p{}-{} failed: {}",
                        sub.id, window.start_page, window.end_page, reason
                    );
                    state.counters.failed += 1;
                }
            }

            if slice_state.is_failure() {
                state.consecutive_failures += 1;
            } else if slice_state == SliceState::Accepted {
                state.consecutive_failures = 0;
            }

            if let Some(cb) = &self.config.progress_callback {
                cb.on_slice_complete(window.start_page, window.end_page, label);
            }
            report.outcomes.push((*window, slice_state));

            if state.consecutive_failures >= self.config.max_consecutive_failures {
                warn!(
                    "{}: {} consecutive window failures, skipping the rest of this sub-document",
                    sub.id, state.consecutive_failures
                );
                report.error = Some(ChunkError::TooManyFailures {
                    chunk: sub.id.clone(),
                    failures: state.consecutive_failures,
                });
                break;
            }
        }

        self.model.release(&handle).await;
        report
    }

    async fn upload(&self, source: &Path, sub: &SubDocument) -> Result<RemoteHandle, ChunkError> {
        let label = format!("upload {}", sub.id);
        retry_call(
            &label,
            self.config.max_retries,
            self.policy,
            self.limiter,
            |e: &RemoteError| RetryClass::for_remote(e.kind),
            move |_| self.model.upload(source, sub),
        )
        .await
        .map_err(|e| ChunkError::UploadFailed {
            chunk: sub.id.clone(),
            detail: e.to_string(),
        })
    }

    /// Poll until the upload is ready, failed, or the timeout elapses.
    async fn wait_until_ready(
        &self,
        sub: &SubDocument,
        handle: &RemoteHandle,
    ) -> Result<(), ChunkError> {
        let deadline = Instant::now() + self.config.upload_timeout;
        loop {
            match self.model.status(handle).await {
                Ok(UploadState::Ready) => return Ok(()),
                Ok(UploadState::Failed(detail)) => {
                    return Err(ChunkError::UploadFailed {
                        chunk: sub.id.clone(),
                        detail,
                    })
                }
                Ok(UploadState::Processing) => {}
                Err(e) if e.kind == RemoteErrorKind::Fatal => {
                    return Err(ChunkError::UploadFailed {
                        chunk: sub.id.clone(),
                        detail: e.to_string(),
                    })
                }
                Err(e) => warn!("{}: status poll failed: {}", sub.id, e),
            }
            if Instant::now() >= deadline {
                return Err(ChunkError::ProcessingTimeout {
                    chunk: sub.id.clone(),
                    secs: self.config.upload_timeout.as_secs(),
                });
            }
            sleep(self.config.upload_poll_interval).await;
        }
    }

    /// Transcribe one window to a terminal outcome.
    pub async fn extract_window(&self, handle: &RemoteHandle, window: PageWindow) -> WindowOutcome {
        let label = format!("OCR p{}-{}", window.start_page, window.end_page);
        let result = retry_call(
            &label,
            self.config.max_retries,
            self.policy,
            self.limiter,
            WindowError::retry_class,
            move |_| self.attempt_window(handle, window),
        )
        .await;

        match result {
            Ok(Draft::Full(text)) => WindowOutcome::Accepted(text),
            Ok(Draft::Short(text)) => WindowOutcome::TooShort {
                chars: text.chars().count(),
            },
            Err(exhausted) => match exhausted.last {
                WindowError::Repetitive { .. } => WindowOutcome::Repetitive {
                    attempts: exhausted.attempts,
                },
                WindowError::Remote(e) => WindowOutcome::Failed {
                    reason: e.to_string(),
                },
            },
        }
    }

    async fn attempt_window(
        &self,
        handle: &RemoteHandle,
        window: PageWindow,
    ) -> Result<Draft, WindowError> {
        let primary = self.transcribe(&self.config.ocr_model, handle, window).await?;
        match self.gate.assess(&primary) {
            Quality::Acceptable => return Ok(Draft::Full(primary)),
            Quality::Repetitive { score } => return Err(WindowError::Repetitive { score }),
            Quality::TooShort { chars } => {
                debug!(
                    "p{}-{}: {} chars from {}",
                    window.start_page, window.end_page, chars, self.config.ocr_model
                );
            }
        }

        let Some(fallback) = self.config.active_fallback() else {
            return Ok(Draft::Short(primary));
        };
        self.limiter.acquire().await;
        let alternative = match self.transcribe(fallback, handle, window).await {
            Ok(text) => text,
            // Quota and transient failures go back to the retry loop for its backoff.
            Err(e) if RetryClass::for_remote(e.kind) == RetryClass::Backoff => {
                warn!(
                    "p{}-{}: fallback model {} {:?}: {}",
                    window.start_page, window.end_page, fallback, e.kind, e
                );
                return Err(e.into());
            }
            Err(e) => {
                warn!(
                    "p{}-{}: fallback model {} failed: {}",
                    window.start_page, window.end_page, fallback, e
                );
                String::new()
            }
        };
        let longer = if alternative.chars().count() > primary.chars().count() {
            alternative
        } else {
            primary
        };
        match self.gate.assess(&longer) {
            Quality::Acceptable => Ok(Draft::Full(longer)),
            Quality::Repetitive { score } => Err(WindowError::Repetitive { score }),
            Quality::TooShort { .. } => Ok(Draft::Short(longer)),
        }
    }

    /// One OCR call, cleaned. An empty body counts as empty text so the
    /// short-output fallback applies to it.
    async fn transcribe(
        &self,
        model: &str,
        handle: &RemoteHandle,
        window: PageWindow,
    ) -> Result<String, RemoteError> {
        let prompt = ocr_page_prompt(window.start_page, window.end_page);
        let request = GenerateRequest {
            model,
            input: RemoteInput::Document { handle, window },
            system: Some(OCR_SYSTEM_PROMPT),
            prompt: &prompt,
            options: GenerateOptions {
                temperature: 0.0,
                max_output_tokens: self.config.max_output_tokens,
                stop_sequences: vec![STOP_MARKER.to_string()],
                response_format: ResponseFormat::Text,
            },
        };
        match self.model.generate(request).await.into_text() {
            Ok(raw) => Ok(clean_ocr_text(&raw)),
            Err(e) if e.kind == RemoteErrorKind::Malformed => {
                debug!("{}: {}", model, e);
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::split::{page_windows, split_document, Document};
    use crate::pipeline::testing::{looping_text, page_text, ScriptedModel};
    use std::time::Duration;

    fn config() -> ExtractionConfig {
        ExtractionConfig::builder()
            .pages_per_chunk(21)
            .overlap_pages(3)
            .pages_per_request(7)
            .request_overlap_pages(0)
            .max_retries(2)
            .upload_timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    fn sub_and_windows(config: &ExtractionConfig) -> (SubDocument, Vec<PageWindow>) {
        let doc = Document::new("/books/duoc_lieu.pdf", 21);
        let sub = split_document(&doc, config.pages_per_chunk, config.overlap_pages)
            .unwrap()
            .remove(0);
        let windows =
            page_windows(&sub, config.pages_per_request, config.request_overlap_pages).unwrap();
        (sub, windows)
    }

    async fn run(model: &ScriptedModel, config: &ExtractionConfig) -> (SliceReport, RunState) {
        let limiter = RateLimiter::new(config.requests_per_minute, config.min_request_delay);
        let policy = BackoffPolicy::from_config(config);
        let extractor = SliceExtractor::new(model, config, &limiter, &policy);
        let (sub, windows) = sub_and_windows(config);
        let mut state = RunState::new();
        let report = extractor
            .extract(Path::new("/books/duoc_lieu.pdf"), &sub, &windows, &mut state)
            .await;
        (report, state)
    }

    #[tokio::test(start_paused = true)]
    async fn all_windows_accepted_in_order() {
        let model = ScriptedModel::new()
            .text(page_text("a"))
            .text(page_text("b"))
            .text(page_text("c"));
        let (report, state) = run(&model, &config()).await;
        assert!(report.error.is_none());
        let ranges: Vec<_> = report.slices.iter().map(|s| (s.start_page, s.end_page)).collect();
        assert_eq!(ranges, vec![(1, 7), (8, 14), (15, 21)]);
        assert_eq!(state.counters.accepted, 3);
        assert_eq!(model.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_output_uses_fallback_and_keeps_longer() {
        let config = config();
        let model = ScriptedModel::new()
            .text("trang trắng")
            .text(page_text("fallback"))
            .text(page_text("b"))
            .text(page_text("c"));
        let (report, _) = run(&model, &config).await;
        assert_eq!(report.slices[0].text, page_text("fallback"));
        assert_eq!(
            &model.calls()[..2],
            [config.ocr_model.clone(), "gemini-2.0-flash-lite".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_quota_error_backs_off_and_retries() {
        let config = config();
        let model = ScriptedModel::new()
            .text("trang trắng")
            .error("429 Too Many Requests: quota exceeded")
            .text("trang trắng")
            .text(page_text("fallback"))
            .text(page_text("b"))
            .text(page_text("c"));
        let started = tokio::time::Instant::now();
        let (report, state) = run(&model, &config).await;
        assert_eq!(report.outcomes[0].1, SliceState::Accepted);
        assert_eq!(report.slices[0].text, page_text("fallback"));
        assert_eq!(state.counters.too_short, 0);
        assert_eq!(model.calls().len(), 6);
        assert_eq!(model.calls()[1], "gemini-2.0-flash-lite");
        assert!(started.elapsed() >= BackoffPolicy::from_config(&config).base_delay(0) / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn still_short_is_terminal() {
        let model = ScriptedModel::new()
            .text("ít chữ")
            .text("ít chữ hơn nữa")
            .text(page_text("b"))
            .text(page_text("c"));
        let (report, state) = run(&model, &config()).await;
        assert_eq!(report.outcomes[0].1, SliceState::TooShort);
        assert_eq!(state.counters.too_short, 1);
        assert_eq!(model.calls().len(), 4);
        assert_eq!(report.slices.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repetitive_output_is_retried_on_same_model() {
        let config = config();
        let model = ScriptedModel::new()
            .text(looping_text())
            .text(page_text("a"))
            .text(page_text("b"))
            .text(page_text("c"));
        let (report, _) = run(&model, &config).await;
        assert_eq!(report.outcomes[0].1, SliceState::Accepted);
        assert_eq!(&model.calls()[..2], [config.ocr_model.clone(), config.ocr_model.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_window_is_not_returned_twice() {
        let model = ScriptedModel::new()
            .text(page_text("a"))
            .text(format!("  {}  ", page_text("A")))
            .text(page_text("c"));
        let (report, state) = run(&model, &config()).await;
        assert_eq!(report.slices.len(), 2);
        assert_eq!(state.counters.duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_abort_sub_document() {
        let config = ExtractionConfig::builder()
            .pages_per_chunk(21)
            .overlap_pages(3)
            .pages_per_request(5)
            .request_overlap_pages(0)
            .max_consecutive_failures(2)
            .build()
            .unwrap();
        let model = ScriptedModel::new()
            .error("401 Unauthorized: API key revoked")
            .error("401 Unauthorized: API key revoked");
        let (report, state) = run(&model, &config).await;
        assert_eq!(
            report.error,
            Some(ChunkError::TooManyFailures {
                chunk: "duoc_lieu_part001_p1-21".into(),
                failures: 2
            })
        );
        // Fatal errors are not retried; 2 windows attempted out of 5.
        assert_eq!(model.calls().len(), 2);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(state.counters.failed, 2);
        assert_eq!(model.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_upload_times_out() {
        let model = ScriptedModel::new().stuck();
        let (report, _) = run(&model, &config()).await;
        assert_eq!(
            report.error,
            Some(ChunkError::ProcessingTimeout {
                chunk: "duoc_lieu_part001_p1-21".into(),
                secs: 10
            })
        );
        assert!(model.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_state_is_reported() {
        let model = ScriptedModel::new().states(vec![
            UploadState::Processing,
            UploadState::Failed("unsupported file".into()),
        ]);
        let (report, _) = run(&model, &config()).await;
        assert!(matches!(report.error, Some(ChunkError::UploadFailed { .. })));
    }

    #[test]
    fn state_names() {
        assert_eq!(SliceState::TooShort.as_str(), "too_short");
        assert!(SliceState::Repetitive.is_failure());
        assert!(!SliceState::TooShort.is_failure());
    }
}
