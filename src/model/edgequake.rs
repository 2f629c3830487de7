//! [`VisionModel`] over an `edgequake_llm::LLMProvider`.
//!
//! edgequake-llm providers return a whole completion at once, so
//! `stream_text` yields the full text as a single delta followed by the
//! usage event. Provider errors arrive as opaque values; they are mapped onto
//! [`BatchError`] by inspecting their message, which carries the HTTP status
//! for every provider the library supports.

use super::{
    page_list, ModelRequest, StreamEvent, StructuredResponse, TextStream, TokenUsage, VisionModel,
};
use crate::error::BatchError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use futures::stream;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

static STATUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([1-5]\d\d)\b").unwrap());

pub struct EdgequakeModel {
    provider: Arc<dyn LLMProvider>,
    name: String,
}

impl EdgequakeModel {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    /// System message, then one user message carrying the preamble, the page
    /// order and every page image of the batch.
    fn build_messages(request: &ModelRequest) -> Vec<ChatMessage> {
        let text = format!(
            "{}\n\nImages in order: {}.",
            request.preamble,
            page_list(&request.pages)
        );
        let images = request.pages.iter().map(|p| p.image.clone()).collect();
        vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user_with_images(text.as_str(), images),
        ]
    }

    fn options(request: &ModelRequest) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        }
    }

    async fn complete(
        &self,
        request: &ModelRequest,
    ) -> Result<(String, TokenUsage), BatchError> {
        let messages = Self::build_messages(request);
        let options = Self::options(request);
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;
        let usage = TokenUsage {
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        };
        debug!(
            model = %self.name,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "completion received"
        );
        Ok((response.content, usage))
    }
}

#[async_trait]
impl VisionModel for EdgequakeModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_text(&self, request: ModelRequest) -> Result<TextStream, BatchError> {
        let (content, usage) = self.complete(&request).await?;
        let events = vec![Ok(StreamEvent::Delta(content)), Ok(StreamEvent::Usage(usage))];
        Ok(Box::pin(stream::iter(events)))
    }

    async fn extract_regions(
        &self,
        request: ModelRequest,
    ) -> Result<StructuredResponse, BatchError> {
        let (content, usage) = self.complete(&request).await?;
        Ok(StructuredResponse {
            content,
            usage: Some(usage),
        })
    }
}

/// Map a provider error message onto the batch error taxonomy.
pub(crate) fn classify_provider_error(message: &str) -> BatchError {
    let lower = message.to_lowercase();
    let message = message.to_string();

    if lower.contains("timed out") || lower.contains("timeout") {
        return BatchError::Timeout { secs: 0 };
    }
    if lower.contains("rate limit") || lower.contains("too many requests") {
        return BatchError::RateLimited {
            retry_after_secs: None,
        };
    }
    if lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        return BatchError::Auth(message);
    }
    if let Some(status) = STATUS_RE
        .captures(&lower)
        .and_then(|c| c[1].parse::<u16>().ok())
    {
        return BatchError::from_status(status, message);
    }
    BatchError::Network(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_message() {
        assert!(matches!(
            classify_provider_error("request timed out"),
            BatchError::Timeout { .. }
        ));
        assert!(matches!(
            classify_provider_error("Rate limit reached for gpt-4.1"),
            BatchError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_provider_error("API error: 401 Unauthorized"),
            BatchError::Auth(_)
        ));
        assert!(matches!(
            classify_provider_error("API error (status 400): invalid model"),
            BatchError::MalformedRequest(_)
        ));
        assert!(matches!(
            classify_provider_error("API error (status 503): overloaded"),
            BatchError::Http { status: 503, .. }
        ));
        assert!(matches!(
            classify_provider_error("connection reset by peer"),
            BatchError::Network(_)
        ));
    }
}
