//! PolyMind - Multi-Provider Reasoning Gateway
//!
//! Routes chat/reasoning requests across several hosted LLM providers with:
//! - Deterministic chain selection by reasoning depth, with bounded fallback
//! - Typed event streaming (content fragments + reasoning steps)
//! - A durable self-learning interaction store with per-tag pattern aggregates
//! - An HTTP API and CLI over both
//!
//! # Example
//!
//! ```ignore
//! use polymind::config::Config;
//! use polymind::dispatch::{DispatchMode, DispatchRequest};
//! use polymind::server::build_core;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let (dispatcher, _learner) = build_core(&config).await?;
//!     let stream = dispatcher
//!         .dispatch(DispatchRequest::new("2+2?"), DispatchMode::Auto)
//!         .await?;
//!     println!("{}", stream.collect().await.response);
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod providers;
pub mod dispatch;
pub mod learner;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use dispatch::{
    DispatchError, DispatchMode, DispatchOptions, DispatchRequest, DispatchStream, Dispatcher,
};

pub use learner::{Learner, LearnerError};

pub use providers::{Provider, ProviderError, ProviderId};

pub use types::{Depth, Interaction, LearningStats, Pattern, StreamEvent};

pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
