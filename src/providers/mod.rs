//! Provider adapters.
//!
//! Every hosted backend is reached through the single [`Provider`] trait;
//! the dispatcher never sees a provider-specific wire shape. Adding a
//! backend means writing one adapter and one capability row — dispatch
//! control flow stays untouched.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
mod sse;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::Stream;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ProvidersConfig;
use crate::types::{Depth, ReasoningStep};

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Stable identifiers for the built-in providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Openai,
    Deepseek,
    Anthropic,
    Gemini,
    Ollama,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Openai,
        ProviderId::Deepseek,
        ProviderId::Anthropic,
        ProviderId::Gemini,
        ProviderId::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Openai => "openai",
            ProviderId::Deepseek => "deepseek",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
            ProviderId::Ollama => "ollama",
        }
    }

    /// Parse an identifier, accepting the aliases clients commonly send.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" | "gpt" | "chatgpt" => Some(ProviderId::Openai),
            "deepseek" => Some(ProviderId::Deepseek),
            "anthropic" | "claude" => Some(ProviderId::Anthropic),
            "gemini" | "google" => Some(ProviderId::Gemini),
            "ollama" | "llama" | "local" => Some(ProviderId::Ollama),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown provider '{s}'"))
    }
}

/// Relative cost/latency class used by the chain policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Fast,
    Balanced,
    Thorough,
}

/// What a provider needs before it can be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    ApiKey,
    LocalDaemon,
}

/// Static capability row. The table is read-only after startup; the
/// dispatcher keeps no other state between requests.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCaps {
    pub id: ProviderId,
    pub reachability: Reachability,
    pub speed: SpeedClass,
    pub streaming: bool,
    pub vision: bool,
    /// Nominal confidence attached to reasoning steps from this backend.
    pub step_confidence: f64,
}

/// Built-in capability table, indexed by `ProviderId` discriminant.
pub const CAPABILITIES: [ProviderCaps; 5] = [
    ProviderCaps {
        id: ProviderId::Openai,
        reachability: Reachability::ApiKey,
        speed: SpeedClass::Balanced,
        streaming: true,
        vision: true,
        step_confidence: 0.85,
    },
    ProviderCaps {
        id: ProviderId::Deepseek,
        reachability: Reachability::ApiKey,
        speed: SpeedClass::Balanced,
        streaming: true,
        vision: false,
        step_confidence: 0.86,
    },
    ProviderCaps {
        id: ProviderId::Anthropic,
        reachability: Reachability::ApiKey,
        speed: SpeedClass::Thorough,
        streaming: true,
        vision: true,
        step_confidence: 0.87,
    },
    ProviderCaps {
        id: ProviderId::Gemini,
        reachability: Reachability::ApiKey,
        speed: SpeedClass::Fast,
        streaming: true,
        vision: true,
        step_confidence: 0.88,
    },
    ProviderCaps {
        id: ProviderId::Ollama,
        reachability: Reachability::LocalDaemon,
        speed: SpeedClass::Fast,
        streaming: true,
        vision: false,
        step_confidence: 0.90,
    },
];

/// Capability row for a provider.
pub fn caps(id: ProviderId) -> &'static ProviderCaps {
    &CAPABILITIES[id as usize]
}

/// Base64 image payload forwarded untouched to vision-capable backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64-encoded bytes, no data-URI prefix.
    pub data: String,
}

impl ImageData {
    /// Parse a raw base64 string or a `data:<mime>;base64,<payload>` URI,
    /// validating that the payload actually decodes.
    pub fn from_payload(payload: &str) -> Result<Self, String> {
        let (media_type, data) = match payload.strip_prefix("data:") {
            Some(rest) => {
                let (meta, data) = rest
                    .split_once(',')
                    .ok_or_else(|| "malformed data URI (missing comma)".to_string())?;
                let media_type = meta
                    .strip_suffix(";base64")
                    .ok_or_else(|| "data URI must be base64-encoded".to_string())?;
                (media_type.to_string(), data.to_string())
            }
            None => ("image/png".to_string(), payload.to_string()),
        };

        let data: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64
            .decode(data.as_bytes())
            .map_err(|e| format!("invalid base64 image payload: {e}"))?;

        Ok(Self { media_type, data })
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// Inputs the dispatcher hands to an adapter. Depth is advisory: adapters
/// map it onto their backend's effort knobs.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub image: Option<ImageData>,
    pub depth: Depth,
}

/// A single fragment produced by a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Content(String),
    Step(ReasoningStep),
}

/// Boxed stream of provider events. Dropping it aborts the underlying
/// request.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// Failure classes for a single provider attempt.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("credentials rejected: {0}")]
    Auth(String),
}

impl ProviderError {
    /// Whether the fallback chain should advance past this failure.
    /// Credential rejections abort the whole dispatch instead.
    pub fn should_failover(&self) -> bool {
        !matches!(self, ProviderError::Auth(_))
    }

    /// Classify an HTTP error status (plus response body) from a provider.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status.as_u16(), snippet(body));
        match status.as_u16() {
            429 => ProviderError::RateLimited(detail),
            401 | 403 => ProviderError::Auth(detail),
            408 | 500..=599 => ProviderError::Unreachable(detail),
            _ => ProviderError::Malformed(detail),
        }
    }
}

/// Bound error detail to a log-friendly length.
fn snippet(body: &str) -> String {
    const LIMIT: usize = 240;
    let trimmed = body.trim();
    if trimmed.len() <= LIMIT {
        return trimmed.to_string();
    }
    let mut cut = LIMIT;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

/// Uniform capability interface every backend implements.
///
/// `generate` opens one streaming completion. The returned stream yields
/// events in producer order; dropping it must abort the underlying call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, also used in logs and attempt summaries.
    fn id(&self) -> ProviderId;

    /// Open a streaming generation call.
    async fn generate(&self, request: &GenerateRequest) -> Result<EventStream, ProviderError>;
}

/// Build adapters for every enabled, credentialed provider in the config.
/// Order follows [`ProviderId::ALL`], so the result is deterministic.
pub fn build_registry(providers: &ProvidersConfig, client: &Client) -> Vec<Arc<dyn Provider>> {
    let mut registry: Vec<Arc<dyn Provider>> = Vec::new();

    for id in ProviderId::ALL {
        let settings = providers.get(id);
        if !settings.enabled {
            debug!(provider = %id, "provider disabled, skipping");
            continue;
        }

        let api_key = settings.resolve_key();
        if caps(id).reachability == Reachability::ApiKey && api_key.is_none() {
            debug!(provider = %id, "no API key configured, skipping");
            continue;
        }
        let api_key = api_key.unwrap_or_default();

        let adapter: Arc<dyn Provider> = match id {
            ProviderId::Openai | ProviderId::Deepseek => Arc::new(OpenAiProvider::new(
                id,
                client.clone(),
                &settings.base_url,
                api_key,
                &settings.model,
            )),
            ProviderId::Anthropic => Arc::new(AnthropicProvider::new(
                client.clone(),
                &settings.base_url,
                api_key,
                &settings.model,
            )),
            ProviderId::Gemini => Arc::new(GeminiProvider::new(
                client.clone(),
                &settings.base_url,
                api_key,
                &settings.model,
            )),
            ProviderId::Ollama => Arc::new(OllamaProvider::new(
                client.clone(),
                &settings.base_url,
                &settings.model,
            )),
        };
        registry.push(adapter);
    }

    registry
}

/// Accumulates raw "thinking" text and cuts it into numbered steps on
/// newline boundaries, up to the depth budget.
#[derive(Debug)]
pub(crate) struct StepAssembler {
    buffer: String,
    next_index: u32,
    budget: u32,
    confidence: f64,
}

impl StepAssembler {
    pub fn new(confidence: f64, budget: u32) -> Self {
        Self {
            buffer: String::new(),
            next_index: 1,
            budget,
            confidence,
        }
    }

    /// Append thinking text; returns the steps completed by it.
    pub fn push(&mut self, text: &str) -> Vec<ReasoningStep> {
        self.buffer.push_str(text);
        let mut steps = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer = self.buffer[pos + 1..].to_string();
            if !line.is_empty() {
                if let Some(step) = self.emit(line) {
                    steps.push(step);
                }
            }
        }
        steps
    }

    /// Emit any trailing partial line (call when thinking ends).
    pub fn flush(&mut self) -> Vec<ReasoningStep> {
        let line = self.buffer.trim().to_string();
        self.buffer.clear();
        if line.is_empty() {
            return Vec::new();
        }
        self.emit(line).into_iter().collect()
    }

    fn emit(&mut self, thought: String) -> Option<ReasoningStep> {
        if self.next_index > self.budget {
            return None;
        }
        let step = ReasoningStep {
            index: self.next_index,
            thought,
            confidence: self.confidence,
        };
        self.next_index += 1;
        Some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_table_is_aligned_with_ids() {
        for (i, row) in CAPABILITIES.iter().enumerate() {
            assert_eq!(row.id as usize, i, "row {i} out of place");
            assert_eq!(caps(row.id).id, row.id);
        }
    }

    #[test]
    fn provider_id_parses_aliases() {
        assert_eq!(ProviderId::parse("gpt"), Some(ProviderId::Openai));
        assert_eq!(ProviderId::parse("Claude"), Some(ProviderId::Anthropic));
        assert_eq!(ProviderId::parse("llama"), Some(ProviderId::Ollama));
        assert_eq!(ProviderId::parse("google"), Some(ProviderId::Gemini));
        assert_eq!(ProviderId::parse("grok"), None);
        assert_eq!("deepseek".parse::<ProviderId>().unwrap(), ProviderId::Deepseek);
    }

    #[test]
    fn status_classification_matches_failover_rules() {
        let rate_limited = ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(rate_limited, ProviderError::RateLimited(_)));
        assert!(rate_limited.should_failover());

        let down = ProviderError::from_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(matches!(down, ProviderError::Unreachable(_)));
        assert!(down.should_failover());

        let auth = ProviderError::from_status(StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(auth, ProviderError::Auth(_)));
        assert!(!auth.should_failover());

        let bad_request = ProviderError::from_status(StatusCode::BAD_REQUEST, "no such model");
        assert!(matches!(bad_request, ProviderError::Malformed(_)));
        assert!(bad_request.should_failover());
    }

    #[test]
    fn image_payload_accepts_raw_base64_and_data_uris() {
        let raw = ImageData::from_payload("aGVsbG8=").unwrap();
        assert_eq!(raw.media_type, "image/png");
        assert_eq!(raw.data, "aGVsbG8=");

        let uri = ImageData::from_payload("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(uri.media_type, "image/jpeg");
        assert_eq!(uri.data_uri(), "data:image/jpeg;base64,aGVsbG8=");

        assert!(ImageData::from_payload("not base64 at all!!").is_err());
        assert!(ImageData::from_payload("data:image/png,missing-encoding").is_err());
    }

    #[test]
    fn step_assembler_cuts_on_newlines_and_respects_budget() {
        let mut assembler = StepAssembler::new(0.9, 2);
        assert!(assembler.push("first half ").is_empty());

        let steps = assembler.push("done\nsecond done\nthird ignored\n");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].index, 1);
        assert_eq!(steps[0].thought, "first half done");
        assert_eq!(steps[0].confidence, 0.9);
        assert_eq!(steps[1].index, 2);

        // Budget exhausted: nothing more comes out, including on flush.
        assert!(assembler.push("fourth\n").is_empty());
        assert!(assembler.flush().is_empty());
    }

    #[test]
    fn step_assembler_flushes_trailing_partial_line() {
        let mut assembler = StepAssembler::new(0.8, 5);
        assert!(assembler.push("no newline yet").is_empty());
        let steps = assembler.flush();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].thought, "no newline yet");
        assert!(assembler.flush().is_empty());
    }
}
