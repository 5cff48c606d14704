//! OpenAI-compatible chat-completions adapter.
//!
//! DeepSeek (and any other endpoint speaking the same protocol) reuses this
//! adapter with a different base URL and model. Responses stream as SSE
//! `data:` frames ending in a `[DONE]` sentinel; `reasoning` /
//! `reasoning_content` deltas, where the backend sends them, become step
//! records.

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

pub struct OpenAiProvider {
    id: ProviderId,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(
        id: ProviderId,
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id,
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn body<'a>(&'a self, request: &'a GenerateRequest) -> ChatBody<'a> {
        let content = match (&request.image, caps(self.id).vision) {
            (Some(image), true) => Content::Parts(vec![
                Part::Text {
                    text: request.prompt.clone(),
                },
                Part::ImageUrl {
                    image_url: ImageUrl {
                        url: image.data_uri(),
                    },
                },
            ]),
            _ => Content::Text(&request.prompt),
        };

        ChatBody {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content,
            }],
            stream: true,
            max_tokens: request.depth.max_output_tokens(),
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    stream: bool,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Content<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Content<'a> {
    Text(&'a str),
    Parts(Vec<Part>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Part {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

/// Pull (thinking, content) delta text out of one stream chunk. Chunks
/// without a delta (usage frames, pings) yield neither.
fn delta_text(value: &Value) -> (Option<&str>, Option<&str>) {
    let delta = &value["choices"][0]["delta"];
    let thinking = delta["reasoning"]
        .as_str()
        .or_else(|| delta["reasoning_content"].as_str());
    let content = delta["content"].as_str();
    (thinking, content)
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let confidence = caps(self.id).step_confidence;
        let budget = request.depth.step_budget();

        let stream = try_stream! {
            let mut decoder = SseDecoder::new();
            let mut reasoning = StepAssembler::new(confidence, budget);
            let mut bytes = response.bytes_stream();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| ProviderError::Unreachable(format!("stream aborted: {e}")))?;
                for payload in decoder.push(&String::from_utf8_lossy(&chunk)) {
                    if payload == "[DONE]" {
                        continue;
                    }
                    let value: Value = serde_json::from_str(&payload)
                        .map_err(|e| ProviderError::Malformed(format!("bad stream payload: {e}")))?;

                    let (thinking, content) = delta_text(&value);
                    if let Some(thinking) = thinking {
                        for step in reasoning.push(thinking) {
                            yield ProviderEvent::Step(step);
                        }
                    }
                    if let Some(text) = content {
                        if !text.is_empty() {
                            for step in reasoning.flush() {
                                yield ProviderEvent::Step(step);
                            }
                            yield ProviderEvent::Content(text.to_string());
                        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ImageData;
    use crate::types::Depth;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(
            ProviderId::Openai,
            Client::new(),
            "https://api.openai.com/v1",
            "sk-test",
            "gpt-4o-mini",
        )
    }

    #[test]
    fn body_is_plain_text_without_image() {
        let request = GenerateRequest {
            prompt: "2+2?".into(),
            image: None,
            depth: Depth::Quick,
        };
        let body = serde_json::to_value(provider().body(&request)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "2+2?");
    }

    #[test]
    fn body_carries_image_as_content_parts() {
        let request = GenerateRequest {
            prompt: "what is this?".into(),
            image: Some(ImageData {
                media_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            }),
            depth: Depth::Normal,
        };
        let body = serde_json::to_value(provider().body(&request)).unwrap();
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn delta_text_reads_both_reasoning_spellings() {
        let openai: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"4","reasoning":"add"}}]}"#,
        )
        .unwrap();
        assert_eq!(delta_text(&openai), (Some("add"), Some("4")));

        let deepseek: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"reasoning_content":"carry the one"}}]}"#,
        )
        .unwrap();
        assert_eq!(delta_text(&deepseek), (Some("carry the one"), None));

        let usage_frame: Value = serde_json::from_str(r#"{"usage":{"total_tokens":12}}"#).unwrap();
        assert_eq!(delta_text(&usage_frame), (None, None));
    }
}
