//! Dispatch failure taxonomy surfaced to callers.

use std::fmt;
use thiserror::Error;

use crate::providers::{ProviderError, ProviderId};

/// One failed attempt in an auto-mode chain walk.
#[derive(Debug)]
pub struct AttemptFailure {
    pub provider: ProviderId,
    pub error: ProviderError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

/// Terminal dispatch failures. Mid-stream failures after partial output are
/// delivered as a trailing [`crate::types::StreamEvent::Error`] instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A specific provider could not be reached, timed out, or was rate
    /// limited. Surfaced directly in explicit mode; in auto mode only when
    /// the failure aborts the dispatch.
    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable {
        provider: ProviderId,
        reason: String,
    },

    /// Provider responded with data the adapter could not parse, or with an
    /// empty completion.
    #[error("provider {provider} returned a malformed response: {detail}")]
    ProviderMalformedResponse {
        provider: ProviderId,
        detail: String,
    },

    /// Every candidate in the chain failed; carries one summary per attempt.
    #[error("all {} providers in the chain failed: {}", .attempts.len(), summarize(.attempts))]
    ChainExhausted { attempts: Vec<AttemptFailure> },

    /// Caller input failed validation, or a provider rejected its
    /// credentials. No fallback is attempted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// Collapse a single provider failure into the caller-facing class.
    pub fn from_provider(provider: ProviderId, error: ProviderError) -> Self {
        match error {
            ProviderError::Malformed(detail) => {
                DispatchError::ProviderMalformedResponse { provider, detail }
            }
            ProviderError::Auth(reason) => DispatchError::InvalidRequest(format!(
                "provider {provider} rejected credentials: {reason}"
            )),
            other => DispatchError::ProviderUnavailable {
                provider,
                reason: other.to_string(),
            },
        }
    }
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn chain_exhausted_lists_every_attempt() {
        let error = DispatchError::ChainExhausted {
            attempts: vec![
                AttemptFailure {
                    provider: ProviderId::Ollama,
                    error: ProviderError::Timeout(Duration::from_secs(30)),
                },
                AttemptFailure {
                    provider: ProviderId::Openai,
                    error: ProviderError::RateLimited("HTTP 429: slow down".into()),
                },
            ],
        };
        let text = error.to_string();
        assert!(text.starts_with("all 2 providers in the chain failed"));
        assert!(text.contains("ollama: timed out"));
        assert!(text.contains("openai: rate limited"));
    }

    #[test]
    fn provider_failures_map_onto_caller_classes() {
        let unavailable = DispatchError::from_provider(
            ProviderId::Gemini,
            ProviderError::Unreachable("HTTP 503".into()),
        );
        assert!(matches!(
            unavailable,
            DispatchError::ProviderUnavailable { provider: ProviderId::Gemini, .. }
        ));

        let malformed = DispatchError::from_provider(
            ProviderId::Openai,
            ProviderError::Malformed("not json".into()),
        );
        assert!(matches!(
            malformed,
            DispatchError::ProviderMalformedResponse { provider: ProviderId::Openai, .. }
        ));

        let auth = DispatchError::from_provider(
            ProviderId::Anthropic,
            ProviderError::Auth("HTTP 401".into()),
        );
        assert!(matches!(auth, DispatchError::InvalidRequest(_)));
    }
}
