//! # edgequake-ocr
//!
//! Convert scanned or born-digital PDFs into Markdown plus extracted figures
//! by driving a Vision Language Model (VLM) over successive page batches.
//!
//! ## Why batches?
//!
//! Sending one page per request loses the document's structure: a section
//! that starts on page 11 and continues on page 12 comes back as two
//! unrelated fragments. Sending the whole document overflows the model's
//! context. Batches of a few pages, each prefixed with a breadcrumb of the
//! headings seen so far, keep the heading hierarchy coherent while staying
//! well inside the context window.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Validate  exists, readable, %PDF magic
//!  ├─ 2. Plan      contiguous batches of `batch_size` pages
//!  └─ per batch, in order:
//!      ├─ 3. Render   rasterise via pdfium (spawn_blocking)
//!      ├─ 4. Extract  text (streamed) ∥ figure regions (JSON), with retry
//!      └─ 5. Commit   append to index.md, crop figures to images/,
//!                     fold headings into the breadcrumb for the next batch
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr::{convert, CancelToken, NoopCallback, ProcessorConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Model auto-detected from OCR_API_BASE_URL / OPENAI_API_KEY / …
//!     let config = ProcessorConfig::builder().batch_size(8).build()?;
//!     let job = convert(
//!         "report.pdf",
//!         None,
//!         config,
//!         Arc::new(NoopCallback),
//!         CancelToken::new(),
//!     )
//!     .await?;
//!     println!("{} → {}", job.status, job.output_dir.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr2md` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ocr = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod convert;
pub mod error;
pub mod job;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{BboxSpace, PageRange, ProcessorConfig, ProcessorConfigBuilder};
pub use convert::{convert, processor_from_config, resolve_model};
pub use error::{BatchError, ErrorClass, PipelineError};
pub use job::{BatchResult, BatchStatus, ErrorRecord, JobState, JobStats, JobStatus, Subtask};
pub use model::{EdgequakeModel, OpenAiCompatModel, VisionModel};
pub use pipeline::figures::ExtractedImage;
pub use pipeline::render::{PageImage, PdfiumRasterizer, Rasterizer};
pub use processor::DocumentProcessor;
pub use progress::{
    CallbackHandle, ChannelCallback, NoopCallback, ProcessingCallback, ProgressEvent, Severity,
};
