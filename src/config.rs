//! Configuration types for batched document conversion.
//!
//! All pipeline behaviour is controlled through [`ProcessorConfig`], built via
//! its [`ProcessorConfigBuilder`]. The value is immutable once handed to a
//! [`crate::processor::DocumentProcessor`]; concurrent jobs share it by
//! cloning, never through a process-wide singleton.

use crate::error::PipelineError;
use crate::model::VisionModel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Configuration for a conversion job.
///
/// # Example
/// ```rust
/// use edgequake_ocr::ProcessorConfig;
///
/// let config = ProcessorConfig::builder()
///     .batch_size(5)
///     .max_retry_attempts(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 5);
/// ```
#[derive(Clone)]
pub struct ProcessorConfig {
    /// Pages sent to the model per request pair. Default: 10.
    ///
    /// Larger batches give the model more layout context per call but make
    /// each retry more expensive and each failure lose more pages.
    pub batch_size: u32,

    /// Which pages to convert. Default: the whole document.
    pub pages: PageRange,

    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 130.
    pub dpi: u32,

    /// Cap on the longest edge of a rendered page, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Crop near-white page margins after rendering. Default: true.
    pub trim_margins: bool,

    /// Channel value above which a pixel counts as white when trimming. Default: 250.
    pub white_threshold: u8,

    /// Attempts per model request before giving up on that half of a batch. Default: 3.
    pub max_retry_attempts: u32,

    /// Base of the exponential backoff in milliseconds. Default: 1000.
    ///
    /// The wait before attempt `k + 1` is `base · 2^k` plus jitter.
    pub retry_base_delay_ms: u64,

    /// Upper bound of the uniform random jitter added to each backoff. Default: 250.
    pub retry_max_jitter_ms: u64,

    /// HTTP statuses at or above this value are retryable. Default: 400.
    ///
    /// 400, 401 and 403 are always fatal regardless of this threshold.
    pub min_http_error_code: u16,

    /// Smallest figure, as a fraction of page area, worth extracting. Default: 0.05.
    pub min_area_fraction: f64,

    /// Largest figure, as a fraction of page area. Default: 0.85.
    ///
    /// Regions covering almost the whole page are nearly always the model
    /// boxing the entire page because it found no real figure.
    pub max_area_fraction: f64,

    /// Coordinate system the model uses for bounding boxes. Default: pixels.
    pub bbox_space: BboxSpace,

    /// Maximum header-stack entries rendered into the preceding context. Default: 32.
    pub context_window_size: usize,

    /// Minimum interval between streamed progress updates. Default: 50 ms.
    pub progress_interval_ms: u64,

    /// How many trailing characters of the streamed text each update carries. Default: 2000.
    pub progress_tail_chars: usize,

    /// Maximum tokens the model may generate per request. Default: 64000.
    pub max_tokens: usize,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Per-request timeout in seconds; a timeout is a retryable error. Default: 300.
    pub api_timeout_secs: u64,

    /// Model identifier. If None, the provider default is used.
    pub model: Option<String>,

    /// Provider name for the edgequake-llm factory ("openai", "anthropic", …).
    pub provider_name: Option<String>,

    /// Base URL of an OpenAI-compatible endpoint. Takes precedence over `provider_name`.
    pub api_base_url: Option<String>,

    /// API key for `api_base_url`.
    pub api_key: Option<String>,

    /// Pre-constructed model client. Takes precedence over everything else.
    pub provider: Option<Arc<dyn VisionModel>>,

    /// Override for the text-mode system prompt.
    pub text_prompt: Option<String>,

    /// Override for the figure-extraction system prompt.
    pub image_prompt: Option<String>,

    /// Price in USD per million input tokens, for cost accounting. Default: 0.
    pub input_cost_per_million: f64,

    /// Price in USD per million output tokens. Default: 0.
    pub output_cost_per_million: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            pages: PageRange::default(),
            dpi: 130,
            max_rendered_pixels: 2000,
            trim_margins: true,
            white_threshold: 250,
            max_retry_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_jitter_ms: 250,
            min_http_error_code: 400,
            min_area_fraction: 0.05,
            max_area_fraction: 0.85,
            bbox_space: BboxSpace::default(),
            context_window_size: 32,
            progress_interval_ms: 50,
            progress_tail_chars: 2000,
            max_tokens: 64000,
            temperature: 0.1,
            api_timeout_secs: 300,
            model: None,
            provider_name: None,
            api_base_url: None,
            api_key: None,
            provider: None,
            text_prompt: None,
            image_prompt: None,
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
        }
    }
}

impl fmt::Debug for ProcessorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorConfig")
            .field("batch_size", &self.batch_size)
            .field("pages", &self.pages)
            .field("dpi", &self.dpi)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("min_http_error_code", &self.min_http_error_code)
            .field("min_area_fraction", &self.min_area_fraction)
            .field("max_area_fraction", &self.max_area_fraction)
            .field("bbox_space", &self.bbox_space)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider.as_ref().map(|_| "<dyn VisionModel>"))
            .finish()
    }
}

impl ProcessorConfig {
    /// Create a new builder for `ProcessorConfig`.
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder {
            config: Self::default(),
        }
    }

    /// USD cost of the given token counts under the configured prices.
    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_cost_per_million
            + output_tokens as f64 * self.output_cost_per_million)
            / 1_000_000.0
    }
}

/// Builder for [`ProcessorConfig`].
#[derive(Debug)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    pub fn batch_size(mut self, n: u32) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn pages(mut self, pages: PageRange) -> Self {
        self.config.pages = pages;
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

    pub fn trim_margins(mut self, v: bool) -> Self {
        self.config.trim_margins = v;
        self
    }

    pub fn white_threshold(mut self, v: u8) -> Self {
        self.config.white_threshold = v;
        self
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.config.max_retry_attempts = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn retry_max_jitter_ms(mut self, ms: u64) -> Self {
        self.config.retry_max_jitter_ms = ms;
        self
    }

    pub fn min_http_error_code(mut self, code: u16) -> Self {
        self.config.min_http_error_code = code;
        self
    }

    pub fn area_bounds(mut self, min: f64, max: f64) -> Self {
        self.config.min_area_fraction = min;
        self.config.max_area_fraction = max;
        self
    }

    pub fn bbox_space(mut self, space: BboxSpace) -> Self {
        self.config.bbox_space = space;
        self
    }

    pub fn context_window_size(mut self, n: usize) -> Self {
        self.config.context_window_size = n;
        self
    }

    pub fn progress_interval_ms(mut self, ms: u64) -> Self {
        self.config.progress_interval_ms = ms;
        self
    }

    pub fn progress_tail_chars(mut self, n: usize) -> Self {
        self.config.progress_tail_chars = n;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn VisionModel>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn text_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.text_prompt = Some(prompt.into());
        self
    }

    pub fn image_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.image_prompt = Some(prompt.into());
        self
    }

    pub fn pricing(mut self, input_per_million: f64, output_per_million: f64) -> Self {
        self.config.input_cost_per_million = input_per_million.max(0.0);
        self.config.output_cost_per_million = output_per_million.max(0.0);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessorConfig, PipelineError> {
        let c = &self.config;
        if c.batch_size == 0 {
            return Err(PipelineError::InvalidConfig("Batch size must be ≥ 1".into()));
        }
        if c.max_retry_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "Retry attempts must be ≥ 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.min_area_fraction)
            || !(0.0..=1.0).contains(&c.max_area_fraction)
            || c.min_area_fraction > c.max_area_fraction
        {
            return Err(PipelineError::InvalidConfig(format!(
                "Area bounds must satisfy 0 ≤ min ≤ max ≤ 1, got {}–{}",
                c.min_area_fraction, c.max_area_fraction
            )));
        }
        if c.pages.start == 0 {
            return Err(PipelineError::InvalidConfig(
                "Pages are 1-indexed, minimum is 1".into(),
            ));
        }
        if let Some(end) = c.pages.end {
            if end < c.pages.start {
                return Err(PipelineError::InvalidConfig(format!(
                    "Invalid page range {}-{}: start must be <= end",
                    c.pages.start, end
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Inclusive, 1-indexed page range. `end = None` means "to the last page".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl Default for PageRange {
    fn default() -> Self {
        Self {
            start: 1,
            end: None,
        }
    }
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Clip against the document's page count, returning `(start, end)`
    /// or `None` when nothing remains.
    pub fn resolve(&self, total_pages: u32) -> Option<(u32, u32)> {
        let end = self.end.unwrap_or(total_pages).min(total_pages);
        let start = self.start.max(1);
        (start <= end).then_some((start, end))
    }
}

/// How the model expresses bounding-box coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BboxSpace {
    /// Absolute pixels of the page image sent to the model. (default)
    #[default]
    Pixels,
    /// 0–1000 grid independent of image size (Qwen-VL style).
    Normalized1000,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ProcessorConfig::default();
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.max_retry_attempts, 3);
        assert_eq!(c.min_http_error_code, 400);
        assert!((c.min_area_fraction - 0.05).abs() < f64::EPSILON);
        assert!((c.max_area_fraction - 0.85).abs() < f64::EPSILON);
        assert_eq!(c.progress_interval_ms, 50);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = ProcessorConfig::builder().batch_size(0).build().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn inverted_area_bounds_rejected() {
        assert!(ProcessorConfig::builder()
            .area_bounds(0.5, 0.1)
            .build()
            .is_err());
    }

    #[test]
    fn inverted_page_range_rejected() {
        assert!(ProcessorConfig::builder()
            .pages(PageRange::new(9, 3))
            .build()
            .is_err());
    }

    #[test]
    fn page_range_clipping() {
        assert_eq!(PageRange::new(3, 10).resolve(4), Some((3, 4)));
        assert_eq!(PageRange::default().resolve(25), Some((1, 25)));
        assert_eq!(PageRange::new(7, 9).resolve(4), None);
        assert_eq!(PageRange::default().resolve(0), None);
    }

    #[test]
    fn cost_uses_per_million_prices() {
        let c = ProcessorConfig::builder().pricing(0.4, 1.6).build().unwrap();
        let cost = c.cost_of(1_000_000, 500_000);
        assert!((cost - 1.2).abs() < 1e-9, "got {cost}");
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = ProcessorConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
    }
}
