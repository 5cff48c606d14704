//! Local Ollama daemon adapter.
//!
//! Unlike the hosted backends, Ollama streams newline-delimited JSON rather
//! than SSE. A `thinking` field on the message (thinking-capable local
//! models) becomes step records.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::{
    caps, EventStream, GenerateRequest, Provider, ProviderError, ProviderEvent, ProviderId,
    StepAssembler,
};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(client: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn body(&self, request: &GenerateRequest) -> ChatBody<'_> {
        ChatBody {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: request.prompt.clone(),
                images: request
                    .image
                    .as_ref()
                    .map(|image| vec![image.data.clone()]),
            }],
            stream: true,
            options: Options {
                num_predict: request.depth.max_output_tokens(),
            },
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    options: Options,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Serialize)]
struct Options {
    num_predict: u32,
}

/// Decode one NDJSON line into (thinking, content, error).
fn line_fields(value: &Value) -> (Option<&str>, Option<&str>, Option<&str>) {
    let error = value["error"].as_str();
    let message = &value["message"];
    (
        message["thinking"].as_str(),
        message["content"].as_str(),
        error,
    )
}

#[async_trait]
impl Provider for OllamaProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Ollama
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let confidence = caps(ProviderId::Ollama).step_confidence;
        let budget = request.depth.step_budget();

        let stream = try_stream! {
            let mut reasoning = StepAssembler::new(confidence, budget);
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| ProviderError::Unreachable(format!("stream aborted: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }

                    let value: Value = serde_json::from_str(&line)
                        .map_err(|e| ProviderError::Malformed(format!("bad stream line: {e}")))?;

                    let (thinking, content, error) = line_fields(&value);
                    if let Some(error) = error {
                        Err(ProviderError::Unreachable(error.to_string()))?;
                    }
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
