//! The batch orchestrator.
//!
//! [`DocumentProcessor::run`] drives one document from validation to a
//! terminal [`JobState`]:
//!
//! ```text
//! validate ─▶ count pages ─▶ plan ─▶ for each batch (sequentially):
//!     render pages ─▶ context ─▶ ┌ TextExtractor  ┐ ─▶ commit text, headings
//!                                └ ImageExtractor ┘ ─▶ commit figures
//! ```
//!
//! The two extractors of a batch run concurrently on the same page images
//! and fail independently. Batches never overlap, so output is appended in
//! page order no matter which subtask finishes first.
//!
//! Failure policy:
//!
//! * a subtask that exhausts its retries loses its half of the batch; the job
//!   continues and ends `CompletedWithErrors`;
//! * a non-retryable error cancels the sibling subtask, discards the whole
//!   batch and ends the job in `Error`; earlier batches stay committed;
//! * cancelling the job's [`CancelToken`] discards the in-flight batch and
//!   ends the job `Cancelled`.
//!
//! `run` never returns an error and never panics on bad input: every outcome
//! is a terminal `JobState` with an error log.

use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::error::{BatchError, PipelineError};
use crate::job::{BatchResult, BatchStatus, JobState, JobStatus, Subtask};
use crate::model::VisionModel;
use crate::output::{output_dir_for, OutputWriter};
use crate::pipeline::context;
use crate::pipeline::figures::{FigureOutput, ImageExtractor};
use crate::pipeline::input::validate_source;
use crate::pipeline::plan::{plan_batches, Batch, BatchSpan};
use crate::pipeline::render::{self, Rasterizer};
use crate::pipeline::retry::RetryOutcome;
use crate::pipeline::text::{TextExtractor, TextOutput};
use crate::progress::{ProcessingCallback, Severity};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Converts documents batch by batch. One processor can run any number of
/// jobs concurrently; they share only the model client and rasteriser.
pub struct DocumentProcessor {
    config: ProcessorConfig,
    model: Arc<dyn VisionModel>,
    rasterizer: Arc<dyn Rasterizer>,
    text: TextExtractor,
    figures: ImageExtractor,
}

impl DocumentProcessor {
    pub fn new(
        config: ProcessorConfig,
        model: Arc<dyn VisionModel>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Self {
        let text = TextExtractor::new(Arc::clone(&model), &config);
        let figures = ImageExtractor::new(Arc::clone(&model), &config);
        Self {
            config,
            model,
            rasterizer,
            text,
            figures,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Convert `source` into `output_dir` (default: `{stem}_converted` next
    /// to the source) and return the terminal job state.
    pub async fn run(
        &self,
        source: impl AsRef<Path>,
        output_dir: Option<PathBuf>,
        callback: Arc<dyn ProcessingCallback>,
        cancel: CancelToken,
    ) -> JobState {
        let started = Instant::now();
        let source = source.as_ref().to_path_buf();
        let output_dir = output_dir.unwrap_or_else(|| output_dir_for(&source, None));
        let mut job = JobState::new(source, output_dir);
        let callback: &dyn ProcessingCallback = callback.as_ref();

        info!(
            job = %job.id,
            source = %job.source_path.display(),
            model = self.model.name(),
            "starting conversion"
        );

        let processed = match self.prepare(&mut job).await {
            Ok(mut writer) => {
                job.transition(JobStatus::Processing);
                let processed = self.run_batches(&mut job, &mut writer, callback, &cancel).await;
                if let Err(e) = writer.finish().await {
                    fail_job(&mut job, callback, &e);
                }
                processed
            }
            Err(e) => {
                fail_job(&mut job, callback, &e);
                0
            }
        };

        if job.status == JobStatus::Processing {
            let end = if job.has_batch_errors() {
                JobStatus::CompletedWithErrors
            } else {
                JobStatus::Completed
            };
            job.transition(end);
        }

        job.elapsed_ms = started.elapsed().as_millis() as u64;
        let stats = job.stats(processed);
        info!(
            job = %job.id,
            status = %job.status,
            batches = processed,
            input_tokens = stats.input_tokens,
            output_tokens = stats.output_tokens,
            elapsed_ms = job.elapsed_ms,
            "conversion finished"
        );
        callback.on_complete(&stats);
        job
    }

    /// Validate the source, plan the batches and lay out the output directory.
    async fn prepare(&self, job: &mut JobState) -> Result<OutputWriter, PipelineError> {
        validate_source(&job.source_path)?;

        let total =
            render::page_count(Arc::clone(&self.rasterizer), job.source_path.clone()).await?;
        let (start, end) = self.config.pages.resolve(total).ok_or_else(|| {
            PipelineError::PageOutOfRange {
                start: self.config.pages.start,
                end: self.config.pages.end.unwrap_or(total),
                total,
            }
        })?;

        job.batch_plan = plan_batches(start, end, self.config.batch_size);
        info!(
            job = %job.id,
            pages = end - start + 1,
            batches = job.batch_plan.len(),
            "planned pages {start}-{end}"
        );

        OutputWriter::create(job.output_dir.clone()).await
    }

    /// Process every planned batch in order. Returns the number of batches
    /// that were committed.
    async fn run_batches(
        &self,
        job: &mut JobState,
        writer: &mut OutputWriter,
        callback: &dyn ProcessingCallback,
        cancel: &CancelToken,
    ) -> usize {
        let plan = job.batch_plan.clone();
        let total_batches = plan.len();
        let total_pages: usize = plan.iter().map(BatchSpan::page_count).sum();
        let mut pages_rendered = 0;
        let mut processed = 0;

        for (index, span) in plan.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(job = %job.id, batch = index + 1, "cancelled before batch");
                job.transition(JobStatus::Cancelled);
                break;
            }
            job.current_batch_index = index;
            callback.on_batch_start(span.batch_num, total_batches, span.page_count());
            info!(
                job = %job.id,
                batch = span.batch_num + 1,
                of = total_batches,
                "processing pages {}-{}",
                span.start_page,
                span.end_page
            );

            let rendered = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    job.transition(JobStatus::Cancelled);
                    break;
                }
                r = render::render_batch(
                    Arc::clone(&self.rasterizer),
                    job.source_path.clone(),
                    span.start_page,
                    span.end_page,
                    self.config.dpi,
                ) => r,
            };
            let pages = match rendered {
                Ok(pages) => pages,
                Err(e) => {
                    fail_job(job, callback, &e);
                    break;
                }
            };
            for _ in &pages {
                pages_rendered += 1;
                callback.on_page_convert(pages_rendered, total_pages);
            }

            let batch = Batch::new(span, pages);
            let ctx = context::render(&job.header_stack, self.config.context_window_size);
            let result = self.process_batch(job, &batch, &ctx, callback, cancel).await;

            match result.status {
                BatchStatus::Cancelled => {
                    info!(job = %job.id, batch = span.batch_num + 1, "batch discarded on cancel");
                    job.transition(JobStatus::Cancelled);
                    break;
                }
                BatchStatus::FatalFailure => {
                    error!(job = %job.id, batch = span.batch_num + 1, "fatal error, aborting job");
                    job.transition(JobStatus::Error);
                    break;
                }
                BatchStatus::Success | BatchStatus::PartialFailure => {
                    if let Err(e) = self.commit(job, writer, result, callback).await {
                        fail_job(job, callback, &e);
                        break;
                    }
                    processed += 1;
                }
            }
        }
        processed
    }

    /// Run both extractors on one batch and fold their outcomes together.
    async fn process_batch(
        &self,
        job: &mut JobState,
        batch: &Batch,
        ctx: &str,
        callback: &dyn ProcessingCallback,
        cancel: &CancelToken,
    ) -> BatchResult {
        let batch_cancel = cancel.child();

        let text = async {
            let out = self.text.run(batch, ctx, callback, &batch_cancel).await;
            if matches!(out, RetryOutcome::FatalFailure(_)) {
                batch_cancel.cancel();
            }
            out
        };
        let figures = async {
            let out = self.figures.run(batch, ctx, callback, &batch_cancel).await;
            if matches!(out, RetryOutcome::FatalFailure(_)) {
                batch_cancel.cancel();
            }
            out
        };
        let (text, figures) = tokio::join!(text, figures);

        let mut result = BatchResult {
            span: batch.span,
            input_tokens: 0,
            output_tokens: 0,
            markdown_text: None,
            new_header_entries: Vec::new(),
            extracted_images: Vec::new(),
            status: BatchStatus::Success,
        };

        if cancel.is_cancelled() {
            result.status = BatchStatus::Cancelled;
            return result;
        }

        let batch_num = batch.span.batch_num;
        let text_fatal = self.fold_text(job, &mut result, text, callback);
        let figures_fatal = self.fold_figures(job, &mut result, figures, callback);

        if text_fatal || figures_fatal {
            result.status = BatchStatus::FatalFailure;
        } else if result.markdown_text.is_none() {
            result.status = BatchStatus::PartialFailure;
        }
        debug!(batch = batch_num, status = ?result.status, "batch joined");
        result
    }

    /// Returns `true` when the text half failed fatally.
    fn fold_text(
        &self,
        job: &mut JobState,
        result: &mut BatchResult,
        outcome: RetryOutcome<TextOutput>,
        callback: &dyn ProcessingCallback,
    ) -> bool {
        match outcome {
            RetryOutcome::Success(out) => {
                result.input_tokens += out.input_tokens;
                result.output_tokens += out.output_tokens;
                result.markdown_text = Some(out.markdown);
                result.new_header_entries = out.headings;
                false
            }
            RetryOutcome::PartialFailure { error, attempts } => {
                report(job, callback, result.span, Subtask::Text, &error, Some(attempts), Severity::Error);
                false
            }
            RetryOutcome::FatalFailure(error) => {
                report(job, callback, result.span, Subtask::Text, &error, None, Severity::Fatal);
                true
            }
            // Only reachable when the sibling failed fatally.
            RetryOutcome::Cancelled => false,
        }
    }

    /// Returns `true` when the figure half failed fatally.
    fn fold_figures(
        &self,
        job: &mut JobState,
        result: &mut BatchResult,
        outcome: RetryOutcome<FigureOutput>,
        callback: &dyn ProcessingCallback,
    ) -> bool {
        match outcome {
            RetryOutcome::Success(out) => {
                result.input_tokens += out.input_tokens;
                result.output_tokens += out.output_tokens;
                result.extracted_images = out.images;
                false
            }
            RetryOutcome::PartialFailure { error, attempts } => {
                report(job, callback, result.span, Subtask::Figures, &error, Some(attempts), Severity::Error);
                if result.status == BatchStatus::Success {
                    result.status = BatchStatus::PartialFailure;
                }
                false
            }
            RetryOutcome::FatalFailure(error) => {
                report(job, callback, result.span, Subtask::Figures, &error, None, Severity::Fatal);
                true
            }
            RetryOutcome::Cancelled => false,
        }
    }

    /// Write a finished batch: figures, markdown, header stack, counters.
    async fn commit(
        &self,
        job: &mut JobState,
        writer: &mut OutputWriter,
        result: BatchResult,
        callback: &dyn ProcessingCallback,
    ) -> Result<(), PipelineError> {
        let span = result.span;

        // Figures go first: a failed image write must not leave this
        // batch's text in index.md.
        let mut saved = Vec::with_capacity(result.extracted_images.len());
        for image in &result.extracted_images {
            saved.push((writer.save_image(image).await?, image.fig_number));
        }

        if let Some(markdown) = &result.markdown_text {
            writer.append_batch(markdown).await?;
            context::apply(&mut job.header_stack, &result.new_header_entries);
            job.pages_converted += span.page_count();
        }

        for (path, fig_number) in &saved {
            job.images_extracted += 1;
            callback.on_image_extracted(path, *fig_number);
        }

        job.input_tokens += result.input_tokens;
        job.output_tokens += result.output_tokens;
        job.accumulated_cost += self
            .config
            .cost_of(result.input_tokens, result.output_tokens);
        callback.on_page_tokens(span.batch_num, result.input_tokens, result.output_tokens);

        debug!(
            batch = span.batch_num + 1,
            images = result.extracted_images.len(),
            headings = job.header_stack.len(),
            "batch committed"
        );
        Ok(())
    }
}

fn report(
    job: &mut JobState,
    callback: &dyn ProcessingCallback,
    span: BatchSpan,
    subtask: Subtask,
    error: &BatchError,
    attempts: Option<u32>,
    severity: Severity,
) {
    let message = match attempts {
        Some(n) => format!("{error} (gave up after {n} attempts)"),
        None => error.to_string(),
    };
    let line = job
        .record_error(Some(span.batch_num), Some(subtask), message, severity)
        .describe();
    warn!(batch = span.batch_num + 1, %subtask, ?severity, "{line}");
    callback.on_error(&line, severity);
}

fn fail_job(job: &mut JobState, callback: &dyn ProcessingCallback, e: &PipelineError) {
    let message = e.to_string();
    error!(job = %job.id, "{message}");
    job.record_error(None, None, message.clone(), Severity::Fatal);
    callback.on_error(&message, Severity::Fatal);
    job.transition(JobStatus::Error);
}
