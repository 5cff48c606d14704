//! Provider dispatch: deterministic chain selection, bounded fallback, and
//! typed event streaming with exactly-once learner handoff.
//!
//! A dispatch walks the candidate chain until some provider produces its
//! first event. That provider is then committed: its remaining events are
//! pumped through a bounded channel to the caller. Failures before the
//! first event advance the chain (auto mode only); failures after it
//! terminate the stream with a trailing error event instead of switching
//! providers mid-answer. Exactly one Interaction record reaches the learner
//! per dispatched request, however many attempts were made.

pub mod error;
pub mod policy;

pub use error::{AttemptFailure, DispatchError};
pub use policy::DispatchMode;

use futures::Stream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::learner::Learner;
use crate::providers::{
    EventStream, GenerateRequest, ImageData, Provider, ProviderError, ProviderEvent, ProviderId,
};
use crate::types::{Depth, Interaction, ReasoningStep, StreamEvent, StreamFailure};

/// Tag applied when the caller supplies none.
const DEFAULT_TAG: &str = "chat";

/// Dispatch timeouts and channel sizing.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Bound on connect plus time-to-first-event, per provider attempt.
    pub first_event_timeout: Duration,
    /// Maximum silent gap between events once a provider is committed.
    pub idle_timeout: Duration,
    /// Event channel capacity; a slow consumer backpressures the provider
    /// read at this depth.
    pub channel_capacity: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            first_event_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            channel_capacity: 32,
        }
    }
}

/// A reasoning request as the dispatcher sees it.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub text: String,
    pub image: Option<ImageData>,
    pub depth: Depth,
    /// Classification tags for the learner; empty means the default tag.
    pub tags: Vec<String>,
}

impl DispatchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
            depth: Depth::default(),
            tags: Vec::new(),
        }
    }

    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Fully drained dispatch result, for non-streaming callers.
#[derive(Debug)]
pub struct CollectedResponse {
    pub provider: ProviderId,
    pub interaction_id: String,
    pub response: String,
    pub steps: Vec<ReasoningStep>,
    /// Set when the stream ended with a trailing error event.
    pub error: Option<StreamFailure>,
}

/// Stream handed back to the caller. Dropping it cancels the dispatch; the
/// producer notices promptly and stops consuming provider output.
#[derive(Debug)]
pub struct DispatchStream {
    provider: ProviderId,
    interaction_id: String,
    inner: ReceiverStream<StreamEvent>,
}

impl DispatchStream {
    /// The committed provider serving this request.
    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// Id the interaction record will carry, known before completion so
    /// clients can submit feedback later.
    pub fn interaction_id(&self) -> &str {
        &self.interaction_id
    }

    /// Drain the stream to completion.
    pub async fn collect(mut self) -> CollectedResponse {
        let provider = self.provider;
        let interaction_id = self.interaction_id.clone();
        let mut response = String::new();
        let mut steps = Vec::new();
        let mut error = None;
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Content(text) => response.push_str(&text),
                StreamEvent::Step(step) => steps.push(step),
                StreamEvent::Error(failure) => error = Some(failure),
            }
        }
        CollectedResponse {
            provider,
            interaction_id,
            response,
            steps,
            error,
        }
    }
}

impl Stream for DispatchStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Routes requests across the provider fleet. Holds no mutable state: the
/// registry and options are read-only after construction, so any number of
/// dispatches can run concurrently.
pub struct Dispatcher {
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
    learner: Arc<Learner>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        learner: Arc<Learner>,
        options: DispatchOptions,
    ) -> Self {
        let providers: HashMap<ProviderId, Arc<dyn Provider>> =
            providers.into_iter().map(|p| (p.id(), p)).collect();
        Self {
            providers,
            learner,
            options,
        }
    }

    /// Configured provider ids, in the stable [`ProviderId::ALL`] order.
    pub fn configured(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .iter()
            .copied()
            .filter(|id| self.providers.contains_key(id))
            .collect()
    }

    /// Route one request. Returns the committed provider's event stream, or
    /// a terminal error if no provider could start answering.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        mode: DispatchMode,
    ) -> Result<DispatchStream, DispatchError> {
        if request.text.trim().is_empty() && request.image.is_none() {
            return Err(DispatchError::InvalidRequest(
                "empty message with no attachment".into(),
            ));
        }

        let chain: Vec<Arc<dyn Provider>> = match mode {
            DispatchMode::Explicit(id) => {
                let provider = self.providers.get(&id).cloned().ok_or_else(|| {
                    DispatchError::InvalidRequest(format!("provider '{id}' is not configured"))
                })?;
                vec![provider]
            }
            DispatchMode::Auto => {
                let ids = policy::chain(request.depth, &self.configured());
                if ids.is_empty() {
                    return Err(DispatchError::InvalidRequest(
                        "no providers configured".into(),
                    ));
                }
                ids.iter()
                    .filter_map(|id| self.providers.get(id).cloned())
                    .collect()
            }
        };

        let generate = GenerateRequest {
            prompt: request.text.clone(),
            image: request.image.clone(),
            depth: request.depth,
        };
        let tags = interaction_tags(&request);
        let interaction_id = Uuid::new_v4().to_string();

        debug!(mode = %mode, depth = %request.depth, candidates = chain.len(), "dispatching");

        let mut attempts = Vec::new();
        for provider in &chain {
            let id = provider.id();
            match self.open_stream(provider.as_ref(), &generate).await {
                Ok((first, rest)) => {
                    debug!(provider = %id, "provider committed");
                    let (tx, rx) = mpsc::channel(self.options.channel_capacity);
                    let draft = RecordDraft {
                        id: interaction_id.clone(),
                        query: request.text.clone(),
                        tags,
                    };
                    tokio::spawn(pump_events(
                        id,
                        first,
                        rest,
                        tx,
                        self.learner.clone(),
                        draft,
                        self.options.idle_timeout,
                    ));
                    return Ok(DispatchStream {
                        provider: id,
                        interaction_id,
                        inner: ReceiverStream::new(rx),
                    });
                }
                Err(err) if mode == DispatchMode::Auto && err.should_failover() => {
                    warn!(provider = %id, error = %err, "provider failed, advancing chain");
                    attempts.push(AttemptFailure {
                        provider: id,
                        error: err,
                    });
                }
                Err(err) => {
                    let error = DispatchError::from_provider(id, err);
                    self.record_failure(&interaction_id, &request.text, tags, &error)
                        .await;
                    return Err(error);
                }
            }
        }

        let error = DispatchError::ChainExhausted { attempts };
        self.record_failure(&interaction_id, &request.text, tags, &error)
            .await;
        Err(error)
    }

    /// Open a provider stream and wait for its first event, both under one
    /// deadline. Commitment happens only once something arrives.
    async fn open_stream(
        &self,
        provider: &dyn Provider,
        request: &GenerateRequest,
    ) -> Result<(ProviderEvent, EventStream), ProviderError> {
        let deadline = self.options.first_event_timeout;
        let attempt = async {
            let mut stream = provider.generate(request).await?;
            match stream.next().await {
                Some(Ok(event)) => Ok((event, stream)),
                Some(Err(err)) => Err(err),
                None => Err(ProviderError::Malformed(
                    "stream ended without output".into(),
                )),
            }
        };
        tokio::time::timeout(deadline, attempt)
            .await
            .map_err(|_| ProviderError::Timeout(deadline))?
    }

    /// Terminal failure still counts as a completed dispatch: record it,
    /// telemetry-only on store trouble.
    async fn record_failure(
        &self,
        id: &str,
        query: &str,
        tags: Vec<String>,
        error: &DispatchError,
    ) {
        let interaction = Interaction::new(query, "", false, tags)
            .with_id(id)
            .with_feedback(format!("failed: {error}"));
        if let Err(err) = self.learner.record(interaction).await {
            warn!(error = %err, "interaction not recorded");
        }
    }
}

/// Tags the interaction record will carry: the caller's (or the default),
/// plus the depth.
fn interaction_tags(request: &DispatchRequest) -> Vec<String> {
    let mut tags = request.tags.clone();
    if tags.is_empty() {
        tags.push(DEFAULT_TAG.to_string());
    }
    let depth_tag = request.depth.to_string();
    if !tags.contains(&depth_tag) {
        tags.push(depth_tag);
    }
    tags
}

struct RecordDraft {
    id: String,
    query: String,
    tags: Vec<String>,
}

enum EndState {
    Completed,
    Failed(String),
    Canceled,
}

/// Forward provider events into the bounded channel and finalize the
/// interaction record exactly once, whichever way the stream ends.
async fn pump_events(
    provider: ProviderId,
    first: ProviderEvent,
    mut stream: EventStream,
    tx: mpsc::Sender<StreamEvent>,
    learner: Arc<Learner>,
    draft: RecordDraft,
    idle_timeout: Duration,
) {
    let mut transcript = String::new();
    let mut pending = Some(first);

    let end = loop {
        let event = match pending.take() {
            Some(event) => event,
            None => {
                tokio::select! {
                    _ = tx.closed() => break EndState::Canceled,
                    next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                        Err(_) => break EndState::Failed(format!("stream idle for {idle_timeout:?}")),
                        Ok(None) => break EndState::Completed,
                        Ok(Some(Err(err))) => break EndState::Failed(err.to_string()),
                        Ok(Some(Ok(event))) => event,
                    },
                }
            }
        };

        let wire = match event {
            ProviderEvent::Content(text) => {
                transcript.push_str(&text);
                StreamEvent::Content(text)
            }
            ProviderEvent::Step(step) => StreamEvent::Step(step),
        };
        if tx.send(wire).await.is_err() {
            break EndState::Canceled;
        }
    };

    // Release the provider connection before touching the store.
    drop(stream);

    let (success, feedback, failure) = match end {
        EndState::Completed if !transcript.is_empty() => (true, None, None),
        EndState::Completed => {
            let message = "completed without content".to_string();
            (false, Some(format!("failed: {message}")), Some(message))
        }
        EndState::Failed(message) => {
            warn!(provider = %provider, error = %message, "stream failed after commit");
            (false, Some(format!("failed: {message}")), Some(message))
        }
        EndState::Canceled => {
            debug!(provider = %provider, "stream abandoned by caller");
            (false, Some("canceled".to_string()), None)
        }
    };

    if let Some(message) = failure {
        let _ = tx
            .send(StreamEvent::Error(StreamFailure {
                provider: provider.to_string(),
                message,
            }))
            .await;
    }

    let mut interaction =
        Interaction::new(draft.query, transcript, success, draft.tags).with_id(draft.id);
    if let Some(feedback) = feedback {
        interaction = interaction.with_feedback(feedback);
    }
    if let Err(err) = learner.record(interaction).await {
        warn!(error = %err, "interaction not recorded");
    }
}
