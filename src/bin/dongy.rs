//! CLI binary for dongy-extract.
//!
//! A thin shim over the library crate that maps CLI flags (with `DONGY_*`
//! environment fallbacks) to `ExtractionConfig` and prints the run summary.

use anyhow::{Context, Result};
use clap::Parser;
use dongy_extract::{
    extract, ExtractionConfig, ExtractionProgressCallback, MergePolicy, ProgressCallback,
    RunSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over sub-documents; window outcomes scroll above it.
struct CliProgressCallback {
    bar: ProgressBar,
    windows: AtomicUsize,
    skipped_windows: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            windows: AtomicUsize::new(0),
            skipped_windows: AtomicUsize::new(0),
        })
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_chunks: usize, already_done: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} parts  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_chunks as u64);
        self.bar.set_position(already_done as u64);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        let resumed = if already_done > 0 {
            format!(" ({already_done} resumed from checkpoint)")
        } else {
            String::new()
        };
        self.bar.println(format!(
            "{} {}{}",
            cyan("◆"),
            bold(&format!("{total_chunks} sub-documents")),
            dim(&resumed)
        ));
    }

    fn on_chunk_start(&self, index: usize, total: usize, start_page: usize, end_page: usize) {
        self.bar.println(format!(
            "{} Part {}/{}  pages {}-{}",
            cyan("▸"),
            index + 1,
            total,
            start_page,
            end_page
        ));
    }

    fn on_slice_complete(&self, start_page: usize, end_page: usize, state: &str) {
        self.windows.fetch_add(1, Ordering::Relaxed);
        let mark = if state == "accepted" {
            green("✓")
        } else if state == "duplicate" || state == "too_short" {
            self.skipped_windows.fetch_add(1, Ordering::Relaxed);
            dim("·")
        } else {
            self.skipped_windows.fetch_add(1, Ordering::Relaxed);
            red("✗")
        };
        self.bar.println(format!(
            "    {} p{:>4}-{:<4} {}",
            mark,
            start_page,
            end_page,
            dim(state)
        ));
        self.bar.set_message(format!("p{end_page}"));
    }

    fn on_chunk_complete(&self, index: usize, total: usize, records: usize) {
        self.bar.println(format!(
            "  {} Part {}/{}  {}",
            green("✔"),
            index + 1,
            total,
            dim(&format!("{records} records"))
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, index: usize, total: usize, error: &str) {
        let msg: String = if error.chars().count() > 100 {
            error.chars().take(99).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Part {}/{}  {}",
            red("✘"),
            index + 1,
            total,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, successful_chunks: usize, failed_chunks: usize) {
        self.bar.finish_and_clear();
        let windows = self.windows.load(Ordering::Relaxed);
        let skipped = self.skipped_windows.load(Ordering::Relaxed);
        if failed_chunks == 0 {
            eprintln!(
                "{} {} sub-documents extracted  {}",
                green("✔"),
                bold(&successful_chunks.to_string()),
                dim(&format!("{windows} windows, {skipped} skipped"))
            );
        } else {
            eprintln!(
                "{} {} ok, {} failed  {}",
                cyan("⚠"),
                bold(&successful_chunks.to_string()),
                red(&failed_chunks.to_string()),
                dim("rerun the same command to resume")
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract with defaults (Gemini, 200-page parts, 7-page OCR windows)
  dongy data/raw/cay_thuoc.pdf

  # Resume an interrupted run: just run the same command again
  dongy data/raw/cay_thuoc.pdf

  # Ignore the checkpoint and start over
  dongy --fresh data/raw/cay_thuoc.pdf

  # Paid-tier quota, smaller parts, log to a file
  dongy --rpm 60 --min-delay 1 --pages-per-chunk 100 --log-file logs/run.log book.pdf

  # Machine-readable summary
  dongy --json book.pdf > summary.json

OUTPUTS (in --output-dir):
  thuoc_dong_y.json   all records
  vi_thuoc.csv        herbs
  bai_thuoc.csv       prescriptions
  cong_thuc.csv       formula lines (prescription, herb, dosage, role)

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default provider)
  EDGEQUAKE_LLM_PROVIDER  Provider when --provider is not given
  DONGY_*                 Every flag, e.g. DONGY_RPM=30, DONGY_OUTPUT_DIR=out
  RUST_LOG                Log filter, overrides -v / -q

SETUP:
  pdfium must be loadable: place libpdfium next to the binary or on the
  system library path.
"#;

/// Extract herbs, prescriptions and formulas from scanned Đông y books.
#[derive(Parser, Debug)]
#[command(
    name = "dongy",
    version,
    about = "Extract herbs, prescriptions and formula lines from scanned Vietnamese \
             traditional-medicine PDFs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Directory for the JSON and CSV exports.
    #[arg(short, long, env = "DONGY_OUTPUT_DIR", default_value = "data/processed")]
    output_dir: PathBuf,

    /// Directory for checkpoint files.
    #[arg(long, env = "DONGY_CHECKPOINT_DIR", default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Ignore and overwrite an existing checkpoint.
    #[arg(long, env = "DONGY_FRESH")]
    fresh: bool,

    // ── Models ──────────────────────────────────────────────────────────
    /// LLM provider: gemini, openai, anthropic, ollama, …
    #[arg(long, env = "DONGY_PROVIDER")]
    provider: Option<String>,

    /// Vision model for page transcription.
    #[arg(long, env = "DONGY_OCR_MODEL", default_value = "gemini-2.0-flash")]
    ocr_model: String,

    /// Model retried once when a transcription is too short.
    #[arg(long, env = "DONGY_FALLBACK_MODEL", default_value = "gemini-2.0-flash-lite")]
    fallback_model: String,

    /// Disable the fallback model.
    #[arg(long, env = "DONGY_NO_FALLBACK")]
    no_fallback: bool,

    /// Text model for structured extraction.
    #[arg(long, env = "DONGY_TEXT_MODEL", default_value = "gemini-2.5-flash-lite")]
    text_model: String,

    /// Max output tokens per call.
    #[arg(long, env = "DONGY_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    // ── Chunking ────────────────────────────────────────────────────────
    /// Pages per uploaded sub-document.
    #[arg(long, env = "DONGY_PAGES_PER_CHUNK", default_value_t = 200)]
    pages_per_chunk: usize,

    /// Pages shared by neighbouring sub-documents.
    #[arg(long, env = "DONGY_OVERLAP_PAGES", default_value_t = 30)]
    overlap_pages: usize,

    /// Pages per OCR request.
    #[arg(long, env = "DONGY_PAGES_PER_REQUEST", default_value_t = 7)]
    pages_per_request: usize,

    /// Pages shared by neighbouring OCR requests.
    #[arg(long, env = "DONGY_REQUEST_OVERLAP", default_value_t = 3)]
    request_overlap: usize,

    // ── Limits ──────────────────────────────────────────────────────────
    /// Max remote calls per rolling minute.
    #[arg(long, env = "DONGY_RPM", default_value_t = 15)]
    rpm: usize,

    /// Minimum seconds between two calls.
    #[arg(long, env = "DONGY_MIN_DELAY", default_value_t = 4.5)]
    min_delay: f64,

    /// Retries per call after the first attempt.
    #[arg(long, env = "DONGY_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Failed windows in a row that abort a sub-document.
    #[arg(long, env = "DONGY_MAX_CONSECUTIVE_FAILURES", default_value_t = 3)]
    max_consecutive_failures: u32,

    /// Seconds an upload may take to become ready.
    #[arg(long, env = "DONGY_UPLOAD_TIMEOUT", default_value_t = 300)]
    upload_timeout: u64,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DONGY_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Rendering DPI (72–400).
    #[arg(long, env = "DONGY_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    // ── Quality & dedup ─────────────────────────────────────────────────
    /// Transcriptions shorter than this many characters count as empty.
    #[arg(long, env = "DONGY_MIN_OCR_LENGTH", default_value_t = 100)]
    min_ocr_length: usize,

    /// Block similarity above which output counts as a repetition loop.
    #[arg(long, env = "DONGY_REPETITION_THRESHOLD", default_value_t = 0.6)]
    repetition_threshold: f64,

    /// Fuzzy herb-name similarity that counts as the same herb.
    #[arg(long, env = "DONGY_SIMILARITY_THRESHOLD", default_value_t = 0.85)]
    similarity_threshold: f64,

    /// Disable fuzzy herb-name matching.
    #[arg(long, env = "DONGY_NO_FUZZY")]
    no_fuzzy: bool,

    /// How conflicting field values are merged.
    #[arg(long, env = "DONGY_MERGE_POLICY", value_enum, default_value = "prefer-longer")]
    merge_policy: MergePolicyArg,

    // ── Output & logging ────────────────────────────────────────────────
    /// Print the run summary as JSON on stdout.
    #[arg(long, env = "DONGY_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DONGY_NO_PROGRESS")]
    no_progress: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "DONGY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DONGY_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DONGY_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum MergePolicyArg {
    PreferLonger,
    KeepExisting,
}

impl From<MergePolicyArg> for MergePolicy {
    fn from(v: MergePolicyArg) -> Self {
        match v {
            MergePolicyArg::PreferLonger => MergePolicy::PreferLonger,
            MergePolicyArg::KeepExisting => MergePolicy::KeepExisting,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // With the progress bar on stderr, library INFO lines would tear it up;
    // a log file gets the full level regardless.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet || (show_progress && cli.log_file.is_none()) {
        "error"
    } else {
        "info"
    };
    init_logging(level, cli.log_file.as_ref())?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    let summary = extract(&cli.input, &config)
        .await
        .context("Extraction failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&summary);
    }
    Ok(())
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {:?}", parent))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    if !cli.min_delay.is_finite() || cli.min_delay < 0.0 {
        anyhow::bail!("--min-delay must be a non-negative number of seconds");
    }

    let mut builder = ExtractionConfig::builder()
        .output_dir(&cli.output_dir)
        .checkpoint_dir(&cli.checkpoint_dir)
        .resume(!cli.fresh)
        .ocr_model(&cli.ocr_model)
        .fallback_model(Some(cli.fallback_model.clone()))
        .retry_with_fallback(!cli.no_fallback)
        .text_model(&cli.text_model)
        .max_output_tokens(cli.max_tokens)
        .pages_per_chunk(cli.pages_per_chunk)
        .overlap_pages(cli.overlap_pages)
        .pages_per_request(cli.pages_per_request)
        .request_overlap_pages(cli.request_overlap)
        .requests_per_minute(cli.rpm)
        .min_request_delay(Duration::from_secs_f64(cli.min_delay))
        .max_retries(cli.max_retries)
        .max_consecutive_failures(cli.max_consecutive_failures)
        .upload_timeout(Duration::from_secs(cli.upload_timeout))
        .download_timeout_secs(cli.download_timeout)
        .dpi(cli.dpi)
        .min_ocr_length(cli.min_ocr_length)
        .repetition_threshold(cli.repetition_threshold)
        .similarity_threshold(cli.similarity_threshold)
        .use_fuzzy_matching(!cli.no_fuzzy)
        .merge_policy(cli.merge_policy.into());

    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn print_summary(s: &RunSummary) {
    eprintln!(
        "   parts     {} ok / {} failed / {} resumed  (of {})",
        s.successful_chunks, s.failed_chunks, s.resumed_chunks, s.total_chunks
    );
    eprintln!(
        "   windows   {} accepted, {} duplicate, {} too short, {} repetitive, {} failed",
        s.accepted_slices, s.duplicate_slices, s.short_slices, s.repetitive_slices, s.failed_slices
    );
    if s.structured_failures > 0 {
        eprintln!("   {} slices without structured output", red(&s.structured_failures.to_string()));
    }
    eprintln!(
        "   records   {} herbs, {} prescriptions, {} formula lines  {}",
        bold(&s.final_counts.herbs.to_string()),
        bold(&s.final_counts.prescriptions.to_string()),
        bold(&s.final_counts.formula_lines.to_string()),
        dim(&format!("({} merged or dropped)", s.removed_records))
    );
    for path in &s.outputs {
        eprintln!("   {} {}", dim("→"), path.display());
    }
    if !s.checkpoint_cleared {
        eprintln!("   {}", cyan("checkpoint kept; rerun to retry failed parts"));
    }
    eprintln!("   {}", dim(&format!("{:.1}s total", s.total_duration_ms as f64 / 1000.0)));
}
