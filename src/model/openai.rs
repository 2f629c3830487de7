//! OpenAI-compatible chat-completions client with SSE streaming.
//!
//! Works against any endpoint that implements `POST {base}/chat/completions`
//! with image_url content parts: OpenAI itself, vLLM, LM Studio, Ollama's
//! compatibility layer, and hosted Qwen-VL deployments.
//!
//! Text requests are sent with `stream: true` and
//! `stream_options.include_usage` so the final SSE chunk carries token
//! counts. Region requests use `response_format: json_object` and a single
//! non-streamed reply.

use super::{ModelRequest, StreamEvent, StructuredResponse, TextStream, TokenUsage, VisionModel};
use crate::error::{BatchError, PipelineError};
use crate::prompts::page_label;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::RETRY_AFTER, Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Content {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────

pub struct OpenAiCompatModel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::ProviderNotConfigured {
                provider: "openai-compatible".to_string(),
                hint: format!("HTTP client could not be built: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.into(),
            timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Preamble first, then a "Page N:" label before each page image.
    fn build_messages(request: &ModelRequest) -> Vec<Message> {
        let mut content = Vec::with_capacity(1 + request.pages.len() * 2);
        content.push(Content::Text {
            text: request.preamble.clone(),
        });
        for page in &request.pages {
            content.push(Content::Text {
                text: page_label(page.page_num),
            });
            content.push(Content::ImageUrl {
                image_url: ImageUrl {
                    url: format!(
                        "data:{};base64,{}",
                        page.image.mime_type, page.image.data
                    ),
                    detail: "high",
                },
            });
        }
        vec![
            Message {
                role: "system",
                content: vec![Content::Text {
                    text: request.system_prompt.clone(),
                }],
            },
            Message {
                role: "user",
                content,
            },
        ]
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<Response, BatchError> {
        let mut req = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|e| self.map_reqwest(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), model = %self.model, "model request rejected");
        Err(match BatchError::from_status(status.as_u16(), truncate(&text, 500)) {
            BatchError::RateLimited { .. } => BatchError::RateLimited {
                retry_after_secs: retry_after,
            },
            other => other,
        })
    }

    fn map_reqwest(&self, e: reqwest::Error) -> BatchError {
        if e.is_timeout() {
            BatchError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            BatchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl VisionModel for OpenAiCompatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream_text(&self, request: ModelRequest) -> Result<TextStream, BatchError> {
        let body = ChatRequest {
            model: &self.model,
            messages: Self::build_messages(&request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            response_format: None,
        };
        let response = self.send(&body).await?;
        debug!(model = %self.model, pages = request.pages.len(), "text stream opened");

        let (tx, rx) = mpsc::channel(64);
        let timeout_secs = self.timeout_secs;
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::default();
            while let Some(chunk) = bytes.next().await {
                let events = match chunk {
                    Ok(chunk) => parser.feed(&chunk),
                    Err(e) => {
                        let err = if e.is_timeout() {
                            BatchError::Timeout { secs: timeout_secs }
                        } else {
                            BatchError::Network(format!("stream interrupted: {e}"))
                        };
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                for event in events {
                    // Receiver gone: the caller stopped listening (cancelled).
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                if parser.done {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn extract_regions(
        &self,
        request: ModelRequest,
    ) -> Result<StructuredResponse, BatchError> {
        let body = ChatRequest {
            model: &self.model,
            messages: Self::build_messages(&request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
            stream_options: None,
            response_format: Some(ResponseFormat {
                r#type: "json_object",
            }),
        };
        let response = self.send(&body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BatchError::SchemaValidation("response has no message content".into()))?;

        Ok(StructuredResponse {
            content,
            usage: parsed.usage.map(TokenUsage::from),
        })
    }
}

// ── SSE parsing ──────────────────────────────────────────────────────────

/// Incremental parser for `data:` lines of a chat-completions event stream.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseParser {
    buf: Vec<u8>,
    done: bool,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, BatchError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                break;
            }
            match serde_json::from_str::<ChunkResponse>(data) {
                Ok(chunk) => {
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            out.push(Ok(StreamEvent::Delta(text)));
                        }
                    }
                    if let Some(usage) = chunk.usage {
                        out.push(Ok(StreamEvent::Usage(usage.into())));
                    }
                }
                Err(e) => {
                    out.push(Err(BatchError::Network(format!(
                        "malformed stream chunk: {e}"
                    ))));
                }
            }
        }
        out
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestPage;
    use edgequake_llm::ImageData;

    fn request(pages: &[u32]) -> ModelRequest {
        ModelRequest {
            system_prompt: "sys".into(),
            preamble: "ctx".into(),
            pages: pages
                .iter()
                .map(|&n| RequestPage {
                    page_num: n,
                    image: ImageData::new("AAAA".to_string(), "image/png"),
                })
                .collect(),
            max_tokens: 100,
            temperature: 0.1,
        }
    }

    #[test]
    fn request_interleaves_labels_and_images() {
        let msgs = OpenAiCompatModel::build_messages(&request(&[4, 5]));
        let json = serde_json::to_value(&msgs).unwrap();
        let user = &json[1]["content"];
        assert_eq!(user[0]["text"], "ctx");
        assert_eq!(user[1]["text"], "Page 4:");
        assert_eq!(user[2]["type"], "image_url");
        assert_eq!(user[2]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(user[3]["text"], "Page 5:");
    }

    #[test]
    fn sse_parser_handles_split_chunks() {
        let mut p = SseParser::default();
        let first = p.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let second = p.feed(b"lo\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].as_ref().unwrap(),
            &StreamEvent::Delta("Hello".into())
        );
        assert!(p.done);
    }

    #[test]
    fn sse_parser_reads_final_usage_chunk() {
        let mut p = SseParser::default();
        let events = p.feed(
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":120,\"completion_tokens\":30}}\n",
        );
        assert_eq!(
            events[0].as_ref().unwrap(),
            &StreamEvent::Usage(TokenUsage {
                input_tokens: 120,
                output_tokens: 30
            })
        );
    }

    #[test]
    fn sse_parser_ignores_comments_and_keepalives() {
        let mut p = SseParser::default();
        assert!(p.feed(b": keep-alive\n\nevent: ping\n").is_empty());
    }

    #[test]
    fn sse_parser_decodes_multibyte_split() {
        let mut p = SseParser::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(p.feed(&line[..split]).is_empty());
        let events = p.feed(&line[split..]);
        assert_eq!(events[0].as_ref().unwrap(), &StreamEvent::Delta("é".into()));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
