//! Text extraction: stream the batch's markdown from the model.
//!
//! While the stream is open the extractor reports the tail of the text
//! accumulated so far through `on_progress_update`, throttled to one update
//! per `progress_interval_ms`. When the stream ends the text is cleaned and
//! scanned for headings, which the orchestrator folds into the header stack.
//!
//! Token counts are per attempt: a failed attempt's partial stream is thrown
//! away along with its counts.

use super::context::{extract_headings, HeaderEntry};
use super::encode::{encode_pages, estimate_batch_tokens, estimate_text_tokens};
use super::plan::Batch;
use super::postprocess::clean_markdown;
use super::retry::{RetryOutcome, RetryPolicy};
use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::error::BatchError;
use crate::model::{ModelRequest, StreamEvent, TokenUsage, VisionModel};
use crate::progress::{ProcessingCallback, Severity};
use crate::prompts::{build_user_preamble, TEXT_SYSTEM_PROMPT};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// What one successful text request produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextOutput {
    pub markdown: String,
    pub headings: Vec<HeaderEntry>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct TextExtractor {
    model: Arc<dyn VisionModel>,
    policy: RetryPolicy,
    system_prompt: String,
    max_tokens: usize,
    temperature: f32,
    timeout: Duration,
    progress_interval: Duration,
    tail_chars: usize,
}

impl TextExtractor {
    pub fn new(model: Arc<dyn VisionModel>, config: &ProcessorConfig) -> Self {
        Self {
            model,
            policy: RetryPolicy::from_config(config),
            system_prompt: config
                .text_prompt
                .clone()
                .unwrap_or_else(|| TEXT_SYSTEM_PROMPT.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.api_timeout_secs),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            tail_chars: config.progress_tail_chars,
        }
    }

    /// Convert `batch` to markdown, retrying under the policy.
    pub async fn run(
        &self,
        batch: &Batch,
        context: &str,
        callback: &dyn ProcessingCallback,
        cancel: &CancelToken,
    ) -> RetryOutcome<TextOutput> {
        let request = ModelRequest {
            system_prompt: self.system_prompt.clone(),
            preamble: build_user_preamble(context, batch.pages.len()),
            pages: encode_pages(&batch.pages),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let batch_num = batch.span.batch_num;

        self.policy
            .execute_notify(
                cancel,
                |attempt| {
                    let request = request.clone();
                    async move {
                        debug!(batch = batch_num, attempt, "text request");
                        let streamed = tokio::time::timeout(
                            self.timeout,
                            self.stream(request, callback),
                        )
                        .await
                        .map_err(|_| BatchError::Timeout {
                            secs: self.timeout.as_secs(),
                        })??;
                        Ok(self.finish(batch, streamed))
                    }
                },
                |attempt, delay, error| {
                    callback.on_error(
                        &format!(
                            "batch {} text: attempt {attempt} failed ({error}), retrying in {:.1}s",
                            batch_num + 1,
                            delay.as_secs_f64()
                        ),
                        Severity::Warning,
                    );
                },
            )
            .await
    }

    /// Drain the stream, reporting throttled progress.
    async fn stream(
        &self,
        request: ModelRequest,
        callback: &dyn ProcessingCallback,
    ) -> Result<(String, Option<TokenUsage>), BatchError> {
        let mut stream = self.model.stream_text(request).await?;
        let mut text = String::new();
        let mut usage = None;
        let mut last_update: Option<Instant> = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Delta(delta) => {
                    text.push_str(&delta);
                    if last_update.is_none_or(|t| t.elapsed() >= self.progress_interval) {
                        callback.on_progress_update(
                            tail(&text, self.tail_chars),
                            estimate_text_tokens(&text),
                        );
                        last_update = Some(Instant::now());
                    }
                }
                StreamEvent::Usage(u) => usage = Some(u),
            }
        }
        Ok((text, usage))
    }

    fn finish(&self, batch: &Batch, (raw, usage): (String, Option<TokenUsage>)) -> TextOutput {
        let markdown = clean_markdown(&raw);
        let headings = extract_headings(&markdown);
        let input_tokens = usage
            .map(|u| u.input_tokens)
            .filter(|&n| n > 0)
            .unwrap_or_else(|| estimate_batch_tokens(&batch.pages));
        let output_tokens = usage
            .map(|u| u.output_tokens)
            .filter(|&n| n > 0)
            .unwrap_or_else(|| estimate_text_tokens(&raw));
        debug!(
            batch = batch.span.batch_num,
            chars = markdown.len(),
            headings = headings.len(),
            input_tokens,
            output_tokens,
            "text extracted"
        );
        TextOutput {
            markdown,
            headings,
            input_tokens,
            output_tokens,
        }
    }
}

/// The last `n` characters of `s`.
pub fn tail(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_counts_chars_not_bytes() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
        assert_eq!(tail("ünïcödé", 3), "ödé");
        assert_eq!(tail("abc", 0), "");
    }
}
