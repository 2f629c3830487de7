//! The vision-model boundary.
//!
//! The pipeline never talks HTTP itself. It hands a [`ModelRequest`] (system
//! prompt, framing text and the batch's page images) to a [`VisionModel`] and
//! gets back either a stream of text deltas or one structured (JSON) reply.
//!
//! Two implementations ship with the crate:
//!
//! * [`edgequake::EdgequakeModel`] wraps any `edgequake_llm::LLMProvider`
//!   (OpenAI, Anthropic, Gemini, Ollama, …). Those providers answer in one
//!   piece, so the stream carries a single delta.
//! * [`openai::OpenAiCompatModel`] speaks the OpenAI chat-completions wire
//!   format directly over `reqwest`, with true SSE streaming. Use it for any
//!   OpenAI-compatible endpoint (vLLM, LM Studio, hosted Qwen-VL, …).
//!
//! Tests substitute their own in-memory implementation.

pub mod edgequake;
pub mod openai;

use crate::error::BatchError;
use async_trait::async_trait;
use edgequake_llm::ImageData;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

pub use edgequake::EdgequakeModel;
pub use openai::OpenAiCompatModel;

/// Token counts reported by the provider for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One page image attached to a request.
#[derive(Clone)]
pub struct RequestPage {
    pub page_num: u32,
    pub image: ImageData,
}

impl fmt::Debug for RequestPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPage")
            .field("page_num", &self.page_num)
            .field("mime_type", &self.image.mime_type)
            .field("base64_len", &self.image.data.len())
            .finish()
    }
}

/// Everything a model call needs.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    /// User text sent ahead of the images (context and framing).
    pub preamble: String,
    pub pages: Vec<RequestPage>,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// An item of a streamed text response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    /// Provider-reported usage, normally sent once at the end of the stream.
    Usage(TokenUsage),
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, BatchError>> + Send>>;

/// A complete structured reply.
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    /// Raw response text, expected to hold a JSON object.
    pub content: String,
    /// `None` when the provider did not report usage.
    pub usage: Option<TokenUsage>,
}

/// A vision-language model client shared by every job in the process.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Start a streamed free-text completion.
    async fn stream_text(&self, request: ModelRequest) -> Result<TextStream, BatchError>;

    /// Run a completion whose answer must be a single JSON object.
    async fn extract_regions(&self, request: ModelRequest)
        -> Result<StructuredResponse, BatchError>;
}

/// Join the page labels into one line, used by clients that cannot
/// interleave text and images inside a message.
pub(crate) fn page_list(pages: &[RequestPage]) -> String {
    pages
        .iter()
        .map(|p| crate::prompts::page_label(p.page_num))
        .map(|l| l.trim_end_matches(':').to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_list_is_in_request_order() {
        let img = ImageData::new("AA==".to_string(), "image/png");
        let pages = vec![
            RequestPage {
                page_num: 11,
                image: img.clone(),
            },
            RequestPage {
                page_num: 12,
                image: img,
            },
        ];
        assert_eq!(page_list(&pages), "Page 11, Page 12");
    }

    #[test]
    fn vision_model_is_object_safe() {
        fn assert_dyn(_: Option<&dyn VisionModel>) {}
        assert_dyn(None);
    }
}
