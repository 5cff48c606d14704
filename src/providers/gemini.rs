//! Google Gemini adapter (`streamGenerateContent` over SSE).
//!
//! Candidate parts flagged `"thought": true` come from thinking-capable
//! models and are surfaced as step records; plain parts are answer text.

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

pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiProvider {
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

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }

    fn body(&self, request: &GenerateRequest) -> GenerateBody {
        let mut parts = vec![ContentPart {
            text: Some(request.prompt.clone()),
            inline_data: None,
        }];
        if let Some(image) = &request.image {
            parts.push(ContentPart {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: image.media_type.clone(),
                    data: image.data.clone(),
                }),
            });
        }

        GenerateBody {
            contents: vec![TurnContent {
                role: "user",
                parts,
            }],
            generation_config: GenerationConfig {
                max_output_tokens: request.depth.max_output_tokens(),
            },
        }
    }
}

#[derive(Serialize)]
struct GenerateBody {
    contents: Vec<TurnContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct TurnContent {
    role: &'static str,
    parts: Vec<ContentPart>,
}

#[derive(Serialize)]
struct ContentPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

/// Candidate parts of one stream chunk as (is_thought, text) pairs.
fn chunk_parts(value: &Value) -> Vec<(bool, String)> {
    let Some(parts) = value["candidates"][0]["content"]["parts"].as_array() else {
        return Vec::new();
    };
    parts
        .iter()
        .filter_map(|part| {
            let text = part["text"].as_str()?;
            Some((part["thought"].as_bool().unwrap_or(false), text.to_string()))
        })
        .collect()
}

/// Mid-stream error payload, if this chunk is one.
fn chunk_error(value: &Value) -> Option<ProviderError> {
    let error = value.get("error")?;
    let code = error["code"].as_u64().unwrap_or(0);
    let message = error["message"].as_str().unwrap_or("no detail").to_string();
    Some(match code {
        429 => ProviderError::RateLimited(message),
        500..=599 => ProviderError::Unreachable(message),
        _ => ProviderError::Malformed(message),
    })
}

#[async_trait]
impl Provider for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let confidence = caps(ProviderId::Gemini).step_confidence;
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

                    if let Some(err) = chunk_error(&value) {
                        Err(err)?;
                    }
                    for (is_thought, text) in chunk_parts(&value) {
                        if is_thought {
                            for step in reasoning.push(&text) {
                                yield ProviderEvent::Step(step);
                            }
                        } else if !text.is_empty() {
                            for step in reasoning.flush() {
                                yield ProviderEvent::Step(step);
                            }
                            yield ProviderEvent::Content(text);
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

    fn provider() -> GeminiProvider {
        GeminiProvider::new(
            Client::new(),
            "https://generativelanguage.googleapis.com",
            "test-key",
            "gemini-2.0-flash",
        )
    }

    #[test]
    fn url_targets_streaming_sse_endpoint() {
        assert_eq!(
            provider().url(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn body_uses_camel_case_and_inline_image_data() {
        let request = GenerateRequest {
            prompt: "what is this?".into(),
            image: Some(ImageData {
                media_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            }),
            depth: Depth::Deep,
        };
        let body = serde_json::to_value(provider().body(&request)).unwrap();
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "what is this?");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert!(parts[0].get("inlineData").is_none());
    }

    #[test]
    fn chunk_parts_separates_thoughts_from_answer_text() {
        let value: Value = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"weigh both options","thought":true},
                {"text":"4"}
            ]}}]}"#,
        )
        .unwrap();
        assert_eq!(
            chunk_parts(&value),
            vec![(true, "weigh both options".to_string()), (false, "4".to_string())]
        );
        assert!(chunk_parts(&serde_json::json!({"usageMetadata": {}})).is_empty());
    }

    #[test]
    fn chunk_error_maps_rate_limits() {
        let value: Value =
            serde_json::from_str(r#"{"error":{"code":429,"message":"quota"}}"#).unwrap();
        assert!(matches!(
            chunk_error(&value),
            Some(ProviderError::RateLimited(_))
        ));
        assert!(chunk_error(&serde_json::json!({"candidates": []})).is_none());
    }
}
