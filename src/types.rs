//! Shared types used across modules
//!
//! The request/response vocabulary of the dispatcher, the learner, and the
//! HTTP surface lives here to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Caller-selected reasoning effort. Influences both the auto-mode chain
/// ranking and the effort budget forwarded to providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    #[default]
    Quick,
    Normal,
    Deep,
}

impl Depth {
    /// Number of reasoning steps a provider is asked to surface.
    pub fn step_budget(self) -> u32 {
        match self {
            Depth::Quick => 3,
            Depth::Normal => 5,
            Depth::Deep => 8,
        }
    }

    /// Output-token cap forwarded to providers.
    pub fn max_output_tokens(self) -> u32 {
        match self {
            Depth::Quick => 1024,
            Depth::Normal => 4096,
            Depth::Deep => 8192,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Quick => "quick",
            Depth::Normal => "normal",
            Depth::Deep => "deep",
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(Depth::Quick),
            "normal" => Ok(Depth::Normal),
            "deep" => Ok(Depth::Deep),
            other => Err(format!("unknown depth '{other}' (expected quick, normal, or deep)")),
        }
    }
}

/// One structured reasoning step surfaced by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// 1-based position within the stream.
    pub index: u32,
    pub thought: String,
    pub confidence: f64,
}

/// Terminal failure surfaced on an already-open stream, so a client can
/// distinguish "finished normally" from "failed after partial output".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub provider: String,
    pub message: String,
}

/// Typed event on a dispatch stream. Serializes to the wire shape
/// `{"type": "content" | "step" | "error", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Ordered text fragment; fragments concatenate into the final answer.
    Content(String),
    /// Structured reasoning step.
    Step(ReasoningStep),
    /// Trailing failure after partial output. Never followed by more events.
    Error(StreamFailure),
}

/// One completed request/response cycle, as recorded by the learner.
///
/// Immutable after creation except for the `success`/`feedback` pair, which
/// late caller feedback may overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub query: String,
    pub response: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Fixed-length vector for similarity lookup, computed once by the
    /// caller. The core never embeds anything itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Interaction {
    /// New record with a fresh id and the current time.
    pub fn new(
        query: impl Into<String>,
        response: impl Into<String>,
        success: bool,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            response: response.into(),
            success,
            feedback: None,
            timestamp: Utc::now(),
            tags,
            embedding: None,
        }
    }

    /// Pin the id (used by the dispatcher, which advertises the id to the
    /// client before the record is finalized).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Derived aggregate over all interactions sharing a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Category key; one row per distinct tag.
    pub pattern_type: String,
    pub description: String,
    pub occurrences: u64,
    pub success_rate: f64,
    /// Representative queries, bounded, first-seen order.
    pub examples: Vec<String>,
    pub confidence: f64,
}

/// Compact view of a strong pattern for the stats snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub pattern_type: String,
    pub success_rate: f64,
    pub occurrences: u64,
}

/// Read-only learner snapshot. Counts come from the durable store at call
/// time, so late feedback is reflected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub total_interactions: u64,
    pub successful_interactions: u64,
    pub success_rate: f64,
    pub patterns_identified: u64,
    pub top_success_strategies: Vec<StrategySummary>,
}
