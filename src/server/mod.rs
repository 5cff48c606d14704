//! HTTP service: the chat API plus the learner dashboard endpoints.

pub mod http;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::learner::Learner;
use crate::providers::build_registry;

/// Request bodies are capped here; image payloads dominate the budget.
const BODY_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Shared server state. Cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub learner: Arc<Learner>,
    pub started: Instant,
}

/// Build the dispatcher and learner a service (or one-shot CLI call) runs on.
pub async fn build_core(config: &Config) -> Result<(Arc<Dispatcher>, Arc<Learner>)> {
    config.validate()?;

    let db_path = config.storage.database_path()?;
    let learner = Arc::new(
        Learner::open(&db_path)
            .await
            .with_context(|| format!("Failed to open interaction store at {}", db_path.display()))?,
    );

    let client = Client::new();
    let registry = build_registry(&config.providers, &client);
    if registry.is_empty() {
        warn!("no providers configured; set an API key or enable ollama");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        learner.clone(),
        config.dispatch.options(),
    ));
    Ok((dispatcher, learner))
}

/// Assemble the router over prepared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(http::root_handler))
        .route("/api/chat", post(http::chat_handler))
        .route("/api/chat/stream", post(http::chat_stream_handler))
        .route("/api/feedback", post(http::feedback_handler))
        .route("/api/stats", get(http::stats_handler))
        .route("/api/patterns", get(http::patterns_handler))
        .route("/api/health", get(http::health_handler))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server.
pub async fn start(config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid server address")?;

    let db_path = config.storage.database_path()?;
    let (dispatcher, learner) = build_core(&config).await?;
    let providers = dispatcher.configured();

    let state = AppState {
        dispatcher,
        learner,
        started: Instant::now(),
    };
    let app = router(state);

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("     PolyMind Server Starting");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("✓ Server binding to: {}", addr);
    println!("✓ Interaction store: {}", db_path.display());

    if providers.is_empty() {
        println!("⚠ No providers configured");
        println!("  Tip: export OPENAI_API_KEY (or another provider key) and restart");
    } else {
        let names: Vec<&str> = providers.iter().map(|id| id.as_str()).collect();
        println!("✓ Providers: {}", names.join(", "));
    }

    println!();
    println!("🚀 Listening on http://{}", addr);
    println!();

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    Ok(())
}
