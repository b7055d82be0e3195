//! Document-level orchestration and the top-level entry points.
//!
//! [`Extractor::run`] drives one document through every stage, strictly in
//! sequence:
//!
//! ```text
//! checkpoint.load ─▶ for each unprocessed sub-document:
//!                        slices ─▶ structured records ─▶ append ─▶ checkpoint.save
//!                  ─▶ dedup (once) ─▶ sink.persist ─▶ checkpoint.clear (if complete)
//! ```
//!
//! A failing sub-document is recorded in the checkpoint as `last_error` and
//! skipped; the next run with `resume` enabled retries exactly the
//! sub-documents that are not yet marked processed.

use crate::config::ExtractionConfig;
use crate::error::DongyError;
use crate::output::{AggregateResult, ExtractionResult, RunSummary};
use crate::pipeline::backoff::BackoffPolicy;
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore};
use crate::pipeline::dedup::{DedupReport, Deduplicator};
use crate::pipeline::input;
use crate::pipeline::llm::EdgequakeModel;
use crate::pipeline::persist::{FileSink, ResultSink};
use crate::pipeline::rate::RateLimiter;
use crate::pipeline::remote::RemoteModel;
use crate::pipeline::slice::SliceExtractor;
use crate::pipeline::split::{page_windows, split_document, Document, SubDocument};
use crate::pipeline::state::RunState;
use crate::pipeline::structured::StructuredExtractor;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extract records from a PDF file or URL and write the exports into
/// `config.output_dir`.
///
/// # Errors
/// Returns `Err(DongyError)` only for fatal errors: unreadable input,
/// unconfigured provider, checkpoint or output I/O. Failed sub-documents are
/// reported in [`RunSummary::failed_chunks`] and left for a resumed run.
pub async fn extract(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<RunSummary, DongyError> {
    let input_str = input_str.as_ref();
    info!("Starting extraction: {}", input_str);

    let source = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let document = Document::load(source.path()).await?;
    info!("PDF has {} pages", document.total_pages);

    let model = EdgequakeModel::from_config(config)?;
    let sink = FileSink::new(&config.output_dir);
    Extractor::new(model, config.clone())
        .run(&document, &sink)
        .await
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<RunSummary, DongyError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DongyError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input_str, config))
}

/// Runs documents through the pipeline against one [`RemoteModel`].
///
/// The rate limiter lives here, so consecutive runs on the same extractor
/// share one request budget.
pub struct Extractor<M: RemoteModel> {
    model: M,
    config: ExtractionConfig,
    limiter: RateLimiter,
    policy: BackoffPolicy,
}

impl<M: RemoteModel> Extractor<M> {
    pub fn new(model: M, config: ExtractionConfig) -> Self {
        let limiter = RateLimiter::new(config.requests_per_minute, config.min_request_delay);
        let policy = BackoffPolicy::from_config(&config);
        Self {
            model,
            config,
            limiter,
            policy,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Checkpoint location for `document`.
    pub fn checkpoint_store(&self, document: &Document) -> CheckpointStore {
        CheckpointStore::for_document(&self.config.checkpoint_dir, &document.stem())
    }

    /// Process every sub-document of `document` not yet checkpointed, then
    /// dedup and hand the result to `sink`.
    pub async fn run<S: ResultSink>(
        &self,
        document: &Document,
        sink: &S,
    ) -> Result<RunSummary, DongyError> {
        let run_start = Instant::now();
        let subs = split_document(
            document,
            self.config.pages_per_chunk,
            self.config.overlap_pages,
        )?;
        let total = subs.len();

        let store = self.checkpoint_store(document);
        let mut checkpoint = if self.config.resume {
            store.load().await?.unwrap_or_default()
        } else {
            debug!("Resume disabled, starting from scratch");
            Checkpoint::default()
        };
        let resumed = subs
            .iter()
            .filter(|s| checkpoint.is_processed(&s.id))
            .count();
        if resumed > 0 {
            info!("Resuming: {}/{} sub-documents already done", resumed, total);
        }
        info!(
            "{}: {} pages in {} sub-documents",
            document.stem(),
            document.total_pages,
            total
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_start(total, resumed);
        }

        let mut state = RunState::new();
        let mut summary = RunSummary {
            total_chunks: total,
            resumed_chunks: resumed,
            ..Default::default()
        };

        for sub in &subs {
            if checkpoint.is_processed(&sub.id) {
                debug!("{}: already processed, skipping", sub.id);
                continue;
            }
            if let Some(cb) = &self.config.progress_callback {
                cb.on_chunk_start(sub.index, total, sub.start_page, sub.end_page);
            }
            info!(
                "Sub-document {}/{}: pages {}-{}",
                sub.index + 1,
                total,
                sub.start_page,
                sub.end_page
            );

            let (results, error) = self.process_sub_document(document, sub, &mut state).await?;
            let records: usize = results
                .iter()
                .map(|r| r.vi_thuoc.len() + r.bai_thuoc.len() + r.cong_thuc.len())
                .sum();
            for result in results {
                checkpoint.all_results.append(result);
            }

            match error {
                None => {
                    checkpoint.mark_processed(&sub.id);
                    checkpoint.last_error = None;
                    store.save(&mut checkpoint).await?;
                    summary.successful_chunks += 1;
                    info!("{}: done, {} records", sub.id, records);
                    if let Some(cb) = &self.config.progress_callback {
                        cb.on_chunk_complete(sub.index, total, records);
                    }
                }
                Some(message) => {
                    warn!("{}", message);
                    checkpoint.last_error = Some(message.clone());
                    store.save(&mut checkpoint).await?;
                    summary.failed_chunks += 1;
                    if let Some(cb) = &self.config.progress_callback {
                        cb.on_chunk_error(sub.index, total, &message);
                    }
                }
            }
        }

        let counters = state.counters;
        summary.accepted_slices = counters.accepted;
        summary.duplicate_slices = counters.duplicates;
        summary.short_slices = counters.too_short;
        summary.repetitive_slices = counters.repetitive;
        summary.failed_slices = counters.failed;
        summary.structured_failures = counters.structured_failures;

        let (canonical, report) = self.dedup(checkpoint.all_results.clone());
        summary.raw_counts = checkpoint.all_results.counts();
        summary.final_counts = canonical.counts();
        summary.removed_records = report.removed();
        info!(
            "Dedup: {} herbs, {} prescriptions, {} formula lines ({} removed)",
            summary.final_counts.herbs,
            summary.final_counts.prescriptions,
            summary.final_counts.formula_lines,
            summary.removed_records
        );

        summary.outputs = sink.persist(&canonical).await?;

        let pending = subs
            .iter()
            .filter(|s| !checkpoint.is_processed(&s.id))
            .count();
        if pending == 0 {
            store.clear().await?;
            summary.checkpoint_cleared = true;
        } else {
            info!(
                "{} sub-document(s) incomplete; checkpoint kept at {}",
                pending,
                store.path().display()
            );
        }

        summary.total_duration_ms = run_start.elapsed().as_millis() as u64;
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_complete(summary.successful_chunks, summary.failed_chunks);
        }
        info!(
            "Run complete: {} ok, {} failed, {} resumed, {}ms",
            summary.successful_chunks,
            summary.failed_chunks,
            summary.resumed_chunks,
            summary.total_duration_ms
        );
        Ok(summary)
    }

    /// Slices then structured records for one sub-document.
    ///
    /// Records extracted before an abort are returned together with the
    /// error; the sub-document stays unprocessed and is retried on resume.
    async fn process_sub_document(
        &self,
        document: &Document,
        sub: &SubDocument,
        state: &mut RunState,
    ) -> Result<(Vec<ExtractionResult>, Option<String>), DongyError> {
        let windows = page_windows(
            sub,
            self.config.pages_per_request,
            self.config.request_overlap_pages,
        )?;
        let slicer = SliceExtractor::new(&self.model, &self.config, &self.limiter, &self.policy);
        let report = slicer.extract(&document.path, sub, &windows, state).await;

        let structured =
            StructuredExtractor::new(&self.model, &self.config, &self.limiter, &self.policy);
        let mut results = Vec::with_capacity(report.slices.len());
        for slice in &report.slices {
            match structured.extract(slice).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        "{}: p{}-{} structured extraction {}",
                        sub.id, slice.start_page, slice.end_page, e
                    );
                    state.counters.structured_failures += 1;
                }
            }
        }
        Ok((results, report.error.map(|e| e.to_string())))
    }

    fn dedup(&self, all: AggregateResult) -> (AggregateResult, DedupReport) {
        Deduplicator::from_config(&self.config).dedup(all)
    }
}
