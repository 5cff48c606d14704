//! Chain selection policy.
//!
//! Ranking is a fixed per-depth priority table, pure in (mode, depth):
//! `quick` walks the cheap/fast end of the fleet first (the local daemon,
//! then the fast hosted models), `deep` leads with the strongest reasoning
//! backends, and `normal` sits in between. Unconfigured providers are
//! filtered out with order preserved. Re-prioritizing the fleet means
//! editing these tables, never dispatch control flow.

use std::fmt;
use std::str::FromStr;

use crate::providers::ProviderId;
use crate::types::Depth;

/// Provider selection mode for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Walk the depth-ranked chain with fallback.
    Auto,
    /// Attempt exactly one provider, no fallback.
    Explicit(ProviderId),
}

impl DispatchMode {
    /// Parse a client `model` field: `auto` (or empty) selects the chain,
    /// anything else must name a known provider.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Some(DispatchMode::Auto);
        }
        ProviderId::parse(s).map(DispatchMode::Explicit)
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Auto => f.write_str("auto"),
            DispatchMode::Explicit(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown provider '{s}' (or use 'auto')"))
    }
}

const QUICK_ORDER: [ProviderId; 5] = [
    ProviderId::Ollama,
    ProviderId::Gemini,
    ProviderId::Openai,
    ProviderId::Deepseek,
    ProviderId::Anthropic,
];

const NORMAL_ORDER: [ProviderId; 5] = [
    ProviderId::Openai,
    ProviderId::Gemini,
    ProviderId::Anthropic,
    ProviderId::Deepseek,
    ProviderId::Ollama,
];

const DEEP_ORDER: [ProviderId; 5] = [
    ProviderId::Anthropic,
    ProviderId::Openai,
    ProviderId::Deepseek,
    ProviderId::Gemini,
    ProviderId::Ollama,
];

/// Ordered candidate chain for an auto-mode dispatch at `depth`, restricted
/// to the providers currently configured.
pub fn chain(depth: Depth, configured: &[ProviderId]) -> Vec<ProviderId> {
    let order: &[ProviderId; 5] = match depth {
        Depth::Quick => &QUICK_ORDER,
        Depth::Normal => &NORMAL_ORDER,
        Depth::Deep => &DEEP_ORDER,
    };
    order
        .iter()
        .copied()
        .filter(|id| configured.contains(id))
        .collect()
}
