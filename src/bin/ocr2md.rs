//! CLI binary for edgequake-ocr.
//!
//! A thin shim over the library crate: maps flags to `ProcessorConfig`,
//! runs one job per input (optionally several at once) and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr::output::output_dir_for;
use edgequake_ocr::{
    processor_from_config, BboxSpace, CancelToken, JobState, JobStats, JobStatus, NoopCallback,
    PageRange, ProcessingCallback, ProcessorConfig, Severity,
};
use futures::stream::{self, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One progress bar per job. The bar counts pages whose batch has been
/// committed; the message shows the batch in flight and the tail of the
/// text being streamed.
struct CliProgress {
    bar: ProgressBar,
    batch_num: AtomicUsize,
    total_batches: AtomicUsize,
    batch_pages: AtomicU64,
}

impl CliProgress {
    fn new(multi: &MultiProgress, name: &str) -> Arc<Self> {
        let bar = multi.add(ProgressBar::new(0));
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:32.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix(name.to_string());
        bar.set_message("opening…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            batch_num: AtomicUsize::new(0),
            total_batches: AtomicUsize::new(0),
            batch_pages: AtomicU64::new(0),
        })
    }

    fn batch_label(&self) -> String {
        format!(
            "batch {}/{}",
            self.batch_num.load(Ordering::Relaxed) + 1,
            self.total_batches.load(Ordering::Relaxed)
        )
    }
}

impl ProcessingCallback for CliProgress {
    fn on_batch_start(&self, batch_num: usize, total_batches: usize, page_count: usize) {
        self.batch_num.store(batch_num, Ordering::Relaxed);
        self.total_batches.store(total_batches, Ordering::Relaxed);
        self.batch_pages.store(page_count as u64, Ordering::Relaxed);
        self.bar.set_message(self.batch_label());
    }

    fn on_progress_update(&self, text_tail: &str, output_tokens: u64) {
        let line = text_tail.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        let snippet: String = line.chars().take(48).collect();
        self.bar.set_message(format!(
            "{}  {}  {}",
            self.batch_label(),
            dim(&format!("{output_tokens} tok")),
            dim(&snippet)
        ));
    }

    fn on_image_extracted(&self, path: &Path, fig_num: u32) {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        self.bar
            .println(format!("  {} figure {fig_num}  {}", green("✓"), dim(&name)));
    }

    fn on_error(&self, message: &str, severity: Severity) {
        let line = match severity {
            Severity::Warning => format!("  {} {}", yellow("↻"), dim(message)),
            Severity::Error => format!("  {} {}", yellow("⚠"), message),
            Severity::Fatal => format!("  {} {}", red("✗"), red(message)),
        };
        self.bar.println(line);
    }

    fn on_page_convert(&self, _done: usize, total: usize) {
        if self.bar.length() != Some(total as u64) {
            self.bar.set_length(total as u64);
        }
    }

    fn on_page_tokens(&self, _batch_num: usize, input_tokens: u64, output_tokens: u64) {
        self.bar.inc(self.batch_pages.load(Ordering::Relaxed));
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            self.batch_label(),
            dim(&format!("{input_tokens} in / {output_tokens} out")),
        ));
    }

    fn on_complete(&self, _stats: &JobStats) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document into report_converted/ next to it
  ocr2md report.pdf

  # Several documents, two at a time, into ./out/
  ocr2md -j 2 -o out a.pdf b.pdf c.pdf

  # Local OpenAI-compatible server (vLLM, LM Studio, Ollama …)
  ocr2md --api-base-url http://localhost:8000/v1 --model qwen2.5-vl-7b \
         --bbox-space normalized1000 scan.pdf

  # A named provider through edgequake-llm
  ocr2md --provider anthropic --model claude-sonnet-4-20250514 paper.pdf

  # Pages 20-45, smaller batches, JSON job report on stdout
  ocr2md --pages 20-45 --batch-size 5 --json book.pdf > job.json

OUTPUT:
  <stem>_converted/index.md          Markdown, batches appended in page order
  <stem>_converted/images/P_figN.png Figures cropped from page P

ENVIRONMENT VARIABLES:
  OCR_API_BASE_URL        OpenAI-compatible endpoint (…/v1)
  OCR_API_KEY             Bearer token for that endpoint
  OCR_MODEL_NAME          Model ID
  EDGEQUAKE_PROVIDER      edgequake-llm provider (openai, anthropic, gemini, ollama …)
  OPENAI_API_KEY          OpenAI API key (auto-detected)
  ANTHROPIC_API_KEY       Anthropic API key (auto-detected)
  PDFIUM_LIB_PATH         Directory or file of libpdfium; system library otherwise
  RUST_LOG                Overrides the log filter

Press Ctrl-C once to cancel: the batch in flight is discarded and every
batch already written stays in index.md.
"#;

/// Convert PDF documents to Markdown and figures with a vision model.
#[derive(Parser, Debug)]
#[command(
    name = "ocr2md",
    version,
    about = "Convert PDF documents to Markdown and figures with a vision model",
    long_about = "Convert PDF documents to Markdown plus cropped figures by sending page \
batches to a Vision Language Model. Works with any OpenAI-compatible endpoint or any \
provider supported by edgequake-llm.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files to convert.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory to create `<stem>_converted/` in (default: next to each input).
    #[arg(short, long, env = "OCR_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Model ID.
    #[arg(long, env = "OCR_MODEL_NAME")]
    model: Option<String>,

    /// edgequake-llm provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// OpenAI-compatible base URL; takes precedence over --provider.
    #[arg(long, env = "OCR_API_BASE_URL")]
    api_base_url: Option<String>,

    /// API key for --api-base-url.
    #[arg(long, env = "OCR_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Pages per model request.
    #[arg(short, long, env = "OCR_BATCH_SIZE", default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    batch_size: u32,

    /// Page range: all, 5, 3-15 or 3- (1-indexed, inclusive).
    #[arg(long, env = "OCR_PAGES", default_value = "all")]
    pages: String,

    /// Rendering DPI (72–400).
    #[arg(long, env = "OCR_DPI", default_value_t = 130,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Keep page margins instead of trimming near-white borders.
    #[arg(long)]
    no_trim: bool,

    /// Attempts per request before giving up on half a batch.
    #[arg(long, env = "OCR_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base backoff delay in milliseconds (doubles per attempt).
    #[arg(long, env = "OCR_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Coordinate space the model uses for figure boxes.
    #[arg(long, env = "OCR_BBOX_SPACE", value_enum, default_value = "pixels")]
    bbox_space: BboxArg,

    /// Smallest figure kept, as a fraction of the page area.
    #[arg(long, default_value_t = 0.05)]
    min_area: f64,

    /// Largest figure kept, as a fraction of the page area.
    #[arg(long, default_value_t = 0.85)]
    max_area: f64,

    /// Max output tokens per request.
    #[arg(long, env = "OCR_MAX_TOKENS", default_value_t = 64000)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "OCR_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "OCR_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// File with a replacement system prompt for text extraction.
    #[arg(long)]
    text_prompt: Option<PathBuf>,

    /// File with a replacement system prompt for figure detection.
    #[arg(long)]
    image_prompt: Option<PathBuf>,

    /// USD per million input tokens, for the cost summary.
    #[arg(long, env = "OCR_INPUT_PRICE", default_value_t = 0.0)]
    input_price: f64,

    /// USD per million output tokens, for the cost summary.
    #[arg(long, env = "OCR_OUTPUT_PRICE", default_value_t = 0.0)]
    output_price: f64,

    /// Documents converted at the same time.
    #[arg(short, long, env = "OCR_JOBS", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..=32))]
    jobs: u32,

    /// Print the terminal job states as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "OCR_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BboxArg {
    Pixels,
    Normalized1000,
}

impl From<BboxArg> for BboxSpace {
    fn from(v: BboxArg) -> Self {
        match v {
            BboxArg::Pixels => BboxSpace::Pixels,
            BboxArg::Normalized1000 => BboxSpace::Normalized1000,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bars carry the feedback; library logs would tear them.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).await?;
    let processor = processor_from_config(config).context("No usable model provider")?;

    // ── Ctrl-C → cooperative cancel of every job ─────────────────────────
    let root = CancelToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} cancelling…", yellow("■"));
                root.cancel();
            }
        });
    }

    // ── Run jobs ─────────────────────────────────────────────────────────
    let multi = MultiProgress::new();
    let processor = &processor;
    let jobs: Vec<JobState> = stream::iter(cli.inputs.iter().cloned())
        .map(|input| {
            let out = output_dir_for(&input, cli.output_dir.as_deref());
            let callback: Arc<dyn ProcessingCallback> = if show_progress {
                let name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| input.display().to_string());
                CliProgress::new(&multi, &name)
            } else {
                Arc::new(NoopCallback)
            };
            let cancel = root.child();
            async move { processor.run(input, Some(out), callback, cancel).await }
        })
        .buffered(cli.jobs as usize)
        .collect()
        .await;

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let json = serde_json::to_string_pretty(&jobs).context("Failed to serialise job states")?;
        println!("{json}");
    } else if !cli.quiet {
        for job in &jobs {
            print_summary(job);
        }
    }

    let failed = jobs.iter().filter(|j| j.status == JobStatus::Error).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} documents failed", jobs.len());
    }
    Ok(())
}

fn print_summary(job: &JobState) {
    let mark = match job.status {
        JobStatus::Completed => green("✔"),
        JobStatus::CompletedWithErrors | JobStatus::Cancelled => yellow("⚠"),
        _ => red("✘"),
    };
    eprintln!(
        "{mark} {}  {}  →  {}",
        bold(&job.source_path.display().to_string()),
        job.status,
        job.output_dir.display()
    );
    eprintln!(
        "   {} pages  {} figures  {} tokens in / {} out  ${:.4}  {}ms",
        job.pages_converted,
        job.images_extracted,
        dim(&job.input_tokens.to_string()),
        dim(&job.output_tokens.to_string()),
        job.accumulated_cost,
        job.elapsed_ms,
    );
    for err in job.error_log.iter().filter(|e| e.severity != Severity::Warning) {
        eprintln!("   {} {}", red("•"), err.describe());
    }
}

/// Map CLI args to `ProcessorConfig`.
async fn build_config(cli: &Cli) -> Result<ProcessorConfig> {
    let mut builder = ProcessorConfig::builder()
        .batch_size(cli.batch_size)
        .pages(parse_pages(&cli.pages)?)
        .dpi(cli.dpi)
        .trim_margins(!cli.no_trim)
        .max_retry_attempts(cli.max_retries)
        .retry_base_delay_ms(cli.retry_delay_ms)
        .bbox_space(cli.bbox_space.into())
        .area_bounds(cli.min_area, cli.max_area)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .api_timeout_secs(cli.api_timeout)
        .pricing(cli.input_price, cli.output_price);

    if let Some(model) = &cli.model {
        builder = builder.model(model);
    }
    if let Some(provider) = &cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(url) = &cli.api_base_url {
        builder = builder.api_base_url(url);
    }
    if let Some(key) = &cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(path) = &cli.text_prompt {
        builder = builder.text_prompt(read_prompt(path).await?);
    }
    if let Some(path) = &cli.image_prompt {
        builder = builder.image_prompt(read_prompt(path).await?);
    }

    builder.build().context("Invalid configuration")
}

async fn read_prompt(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read prompt from {}", path.display()))
}

/// Parse `--pages` into a `PageRange`.
fn parse_pages(s: &str) -> Result<PageRange> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok(PageRange::default());
    }

    if let Some((start, end)) = s.split_once('-') {
        let start: u32 = start.trim().parse().context("Invalid start page in range")?;
        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {start})");
        }
        let end = end.trim();
        if end.is_empty() {
            return Ok(PageRange { start, end: None });
        }
        let end: u32 = end.parse().context("Invalid end page in range")?;
        if start > end {
            anyhow::bail!("Invalid page range '{start}-{end}': start must be <= end");
        }
        return Ok(PageRange::new(start, end));
    }

    let page: u32 = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {page})");
    }
    Ok(PageRange::new(page, page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ranges() {
        assert_eq!(parse_pages("all").unwrap(), PageRange::default());
        assert_eq!(parse_pages("7").unwrap(), PageRange::new(7, 7));
        assert_eq!(parse_pages("3-15").unwrap(), PageRange::new(3, 15));
        assert_eq!(parse_pages("4-").unwrap(), PageRange { start: 4, end: None });
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("9-2").is_err());
        assert!(parse_pages("x").is_err());
    }

    #[test]
    fn cli_parses_multiple_inputs() {
        let cli = Cli::try_parse_from(["ocr2md", "-j", "2", "a.pdf", "b.pdf"]).unwrap();
        assert_eq!(cli.inputs.len(), 2);
        assert_eq!(cli.jobs, 2);
    }
}
