//! Anthropic Messages adapter.
//!
//! Streams SSE frames whose payloads are typed JSON objects;
//! `content_block_delta` frames carry `text_delta` (answer text) or
//! `thinking_delta` (reasoning, requested for deep dispatches) blocks.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::sse::SseDecoder;
use super::{
    caps, EventStream, GenerateRequest, Provider, ProviderError, ProviderEvent, ProviderId,
    StepAssembler,
};
use crate::types::Depth;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Thinking-token budget requested for deep dispatches. Must stay below the
/// deep output cap.
const THINKING_BUDGET: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn body<'a>(&'a self, request: &GenerateRequest) -> MessagesBody<'a> {
        let mut content = vec![Part::Text {
            text: request.prompt.clone(),
        }];
        if let Some(image) = &request.image {
            content.insert(
                0,
                Part::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type: image.media_type.clone(),
                        data: image.data.clone(),
                    },
                },
            );
        }

        MessagesBody {
            model: &self.model,
            max_tokens: request.depth.max_output_tokens(),
            stream: true,
            messages: vec![Message {
                role: "user",
                content,
            }],
            thinking: (request.depth == Depth::Deep).then_some(Thinking {
                kind: "enabled",
                budget_tokens: THINKING_BUDGET,
            }),
        }
    }
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<Part>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Part {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

enum Frame {
    Text(String),
    Thinking(String),
    Fail(ProviderError),
    Ignore,
}

/// Sort one decoded SSE payload into the handful of frame kinds we act on.
fn classify_frame(value: &Value) -> Frame {
    match value["type"].as_str() {
        Some("content_block_delta") => {
            let delta = &value["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => {
                    Frame::Text(delta["text"].as_str().unwrap_or_default().to_string())
                }
                Some("thinking_delta") => {
                    Frame::Thinking(delta["thinking"].as_str().unwrap_or_default().to_string())
                }
                _ => Frame::Ignore,
            }
        }
        Some("error") => {
            let kind = value["error"]["type"].as_str().unwrap_or("unknown");
            let message = value["error"]["message"].as_str().unwrap_or("no detail");
            let detail = format!("{kind}: {message}");
            Frame::Fail(match kind {
                k if k.contains("rate_limit") => ProviderError::RateLimited(detail),
                k if k.contains("overloaded") || k.contains("api_error") => {
                    ProviderError::Unreachable(detail)
                }
                _ => ProviderError::Malformed(detail),
            })
        }
        // message_start / content_block_start / message_delta / ping / stop
        _ => Frame::Ignore,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let confidence = caps(ProviderId::Anthropic).step_confidence;
        let budget = request.depth.step_budget();

        let stream = try_stream! {
            let mut decoder = SseDecoder::new();
            let mut reasoning = StepAssembler::new(confidence, budget);
            let mut bytes = response.bytes_stream();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| ProviderError::Unreachable(format!("stream aborted: {e}")))?;
                for payload in decoder.push(&String::from_utf8_lossy(&chunk)) {
                    let value: Value = serde_json::from_str(&payload)
                        .map_err(|e| ProviderError::Malformed(format!("bad stream payload: {e}")))?;

                    match classify_frame(&value) {
                        Frame::Thinking(text) => {
                            for step in reasoning.push(&text) {
                                yield ProviderEvent::Step(step);
                            }
                        }
                        Frame::Text(text) => {
                            if !text.is_empty() {
                                for step in reasoning.flush() {
                                    yield ProviderEvent::Step(step);
                                }
                                yield ProviderEvent::Content(text);
                            }
                        }
                        Frame::Fail(err) => {
                            Err(err)?;
                        }
                        Frame::Ignore => {}
                    }
                }
            }

            for step in reasoning.flush() {
                yield ProviderEvent::Step(step);
            }
        };

        Ok(Box::pin(stream))
    }
}
