//! HTTP handlers for the chat API and the learner dashboard.

use axum::{
    body::Body,
    extract::{Json, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dispatch::{DispatchError, DispatchMode, DispatchRequest};
use crate::learner::LearnerError;
use crate::providers::ImageData;
use crate::server::AppState;
use crate::types::{Depth, ReasoningStep};

/// Chat request body, shared by the blocking and streaming endpoints.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub depth: Option<String>,
    /// Provider id, an alias, or "auto" (the default).
    #[serde(default)]
    pub model: Option<String>,
    /// Base64 image payload, raw or as a data URI.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Blocking chat response.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub provider: String,
    pub response: String,
    pub steps: Vec<ReasoningStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub interaction_id: String,
    pub success: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatternsQuery {
    #[serde(default)]
    pub tag: Option<String>,
}

/// Validate a chat body into dispatcher inputs.
fn parse_chat(req: ChatRequest) -> Result<(DispatchRequest, DispatchMode), String> {
    let depth = match req.depth.as_deref() {
        None | Some("") => Depth::default(),
        Some(raw) => raw.parse::<Depth>()?,
    };

    let mode = match req.model.as_deref() {
        None => DispatchMode::Auto,
        Some(raw) => DispatchMode::parse(raw)
            .ok_or_else(|| format!("unknown provider '{raw}' (or use 'auto')"))?,
    };

    let mut request = DispatchRequest::new(req.message).with_depth(depth);
    if let Some(payload) = req.image.as_deref() {
        request = request.with_image(ImageData::from_payload(payload)?);
    }
    if let Some(tags) = req.tags {
        request = request.with_tags(tags);
    }

    Ok((request, mode))
}

/// Map a terminal dispatch failure onto an HTTP error response.
fn dispatch_error_response(error: &DispatchError) -> Response {
    let status = match error {
        DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DispatchError::ProviderUnavailable { .. }
        | DispatchError::ProviderMalformedResponse { .. }
        | DispatchError::ChainExhausted { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

fn learner_error_response(error: &LearnerError) -> Response {
    match error {
        LearnerError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no interaction with id '{id}'") })),
        )
            .into_response(),
        LearnerError::StoreUnavailable(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("interaction store unavailable: {e}") })),
        )
            .into_response(),
    }
}

/// POST /api/chat — dispatch and wait for the full answer.
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Response {
    let (request, mode) = match parse_chat(req) {
        Ok(parsed) => parsed,
        Err(reason) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response();
        }
    };

    let stream = match state.dispatcher.dispatch(request, mode).await {
        Ok(stream) => stream,
        Err(error) => return dispatch_error_response(&error),
    };

    let collected = stream.collect().await;
    if collected.response.is_empty() {
        if let Some(failure) = &collected.error {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": format!("provider {} failed: {}", failure.provider, failure.message),
                    "id": collected.interaction_id,
                })),
            )
                .into_response();
        }
    }

    let response = ChatResponse {
        id: collected.interaction_id,
        provider: collected.provider.to_string(),
        response: collected.response,
        steps: collected.steps,
        error: collected.error.map(|f| f.message),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// POST /api/chat/stream — dispatch and stream NDJSON events.
///
/// A normally finished stream ends without an `error` event; a stream that
/// fails after partial output carries a trailing one.
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Response {
    let (request, mode) = match parse_chat(req) {
        Ok(parsed) => parsed,
        Err(reason) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response();
        }
    };

    let stream = match state.dispatcher.dispatch(request, mode).await {
        Ok(stream) => stream,
        Err(error) => return dispatch_error_response(&error),
    };

    let interaction_id = stream.interaction_id().to_string();
    let provider = stream.provider().to_string();

    let body = Body::from_stream(stream.map(|event| {
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Ok::<Vec<u8>, std::convert::Infallible>(line)
    }));

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    if let Ok(value) = HeaderValue::from_str(&interaction_id) {
        response.headers_mut().insert("x-interaction-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&provider) {
        response.headers_mut().insert("x-provider", value);
    }
    response
}

/// POST /api/feedback — revise the outcome of a stored interaction.
pub async fn feedback_handler(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Response {
    match state
        .learner
        .apply_feedback(&req.interaction_id, req.success, req.feedback.as_deref())
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(error) => learner_error_response(&error),
    }
}

/// GET /api/stats — learner snapshot for the dashboard.
pub async fn stats_handler(State(state): State<AppState>) -> Response {
    match state.learner.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(error) => learner_error_response(&error),
    }
}

/// GET /api/patterns[?tag=…] — all patterns, or those matching one tag.
pub async fn patterns_handler(
    State(state): State<AppState>,
    Query(query): Query<PatternsQuery>,
) -> Response {
    let patterns = match query.tag.as_deref() {
        Some(tag) => state.learner.patterns_for(tag).into_iter().collect(),
        None => state.learner.patterns(),
    };
    (StatusCode::OK, Json(json!({ "patterns": patterns }))).into_response()
}

/// GET /api/health — liveness of the store and the provider fleet.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let store_ok = state.learner.store_healthy().await;
    let providers: Vec<String> = state
        .dispatcher
        .configured()
        .iter()
        .map(|id| id.to_string())
        .collect();

    let status = if store_ok { "ok" } else { "degraded" };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "store": if store_ok { "ok" } else { "unavailable" },
            "providers": providers,
            "uptime_secs": state.started.elapsed().as_secs(),
        })),
    )
        .into_response()
}

/// GET / — service identity and endpoint listing.
pub async fn root_handler() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "name": crate::NAME,
            "version": crate::VERSION,
            "endpoints": [
                "POST /api/chat",
                "POST /api/chat/stream",
                "POST /api/feedback",
                "GET /api/stats",
                "GET /api/patterns",
                "GET /api/health",
            ],
        })),
    )
        .into_response()
}
