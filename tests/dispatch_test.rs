//! End-to-end dispatch behavior over scripted in-process providers.
//!
//! No test here touches the network: each provider is a small script that
//! fails or streams a fixed event sequence, so chain walking, fallback,
//! cancellation, and learner handoff can be asserted exactly.

use async_trait::async_trait;
use futures::stream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use polymind::dispatch::{
    DispatchError, DispatchMode, DispatchOptions, DispatchRequest, Dispatcher,
};
use polymind::learner::{Learner, LearnerError};
use polymind::providers::{
    EventStream, GenerateRequest, Provider, ProviderError, ProviderEvent, ProviderId,
};
use polymind::types::{Depth, ReasoningStep, StreamEvent};

type Script = Box<dyn Fn() -> Result<EventStream, ProviderError> + Send + Sync>;

/// Provider whose every `generate` call runs a fixed script and is counted.
struct Scripted {
    id: ProviderId,
    calls: AtomicUsize,
    script: Script,
}

impl Scripted {
    fn new(
        id: ProviderId,
        script: impl Fn() -> Result<EventStream, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for Scripted {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn generate(&self, _request: &GenerateRequest) -> Result<EventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)()
    }
}

fn events(items: Vec<Result<ProviderEvent, ProviderError>>) -> EventStream {
    Box::pin(stream::iter(items))
}

fn answer(text: &'static str) -> EventStream {
    events(vec![Ok(ProviderEvent::Content(text.to_string()))])
}

/// A stream that never yields; the dispatcher's first-event timeout must
/// cut it off.
fn stalled() -> EventStream {
    Box::pin(stream::pending())
}

async fn learner() -> Arc<Learner> {
    Arc::new(Learner::open_in_memory().await.expect("in-memory learner"))
}

fn options() -> DispatchOptions {
    DispatchOptions {
        first_event_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(5),
        channel_capacity: 8,
    }
}

/// Records land from a spawned pump task after the stream is drained; give
/// the runtime a moment to settle before asserting on learner state.
async fn wait_for_records(learner: &Learner, expected: u64) {
    for _ in 0..100 {
        if learner.stats().await.unwrap().total_interactions >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("learner never reached {expected} recorded interactions");
}

#[tokio::test]
async fn chain_exhaustion_attempts_every_provider_exactly_once() {
    let a = Scripted::new(ProviderId::Openai, || {
        Err(ProviderError::Unreachable("HTTP 503: down".into()))
    });
    let b = Scripted::new(ProviderId::Gemini, || {
        Err(ProviderError::RateLimited("HTTP 429: slow down".into()))
    });
    let c = Scripted::new(ProviderId::Deepseek, || {
        Err(ProviderError::Malformed("not json".into()))
    });

    let learner = learner().await;
    let dispatcher = Dispatcher::new(
        vec![a.clone(), b.clone(), c.clone()],
        learner.clone(),
        options(),
    );

    let err = dispatcher
        .dispatch(
            DispatchRequest::new("2+2?").with_depth(Depth::Normal),
            DispatchMode::Auto,
        )
        .await
        .unwrap_err();

    match err {
        DispatchError::ChainExhausted { attempts } => {
            assert_eq!(attempts.len(), 3);
            let summary = attempts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            assert!(summary.contains("openai"));
            assert!(summary.contains("gemini"));
            assert!(summary.contains("deepseek"));
        }
        other => panic!("expected ChainExhausted, got {other:?}"),
    }

    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(c.calls(), 1);

    // The failed dispatch still produces exactly one interaction record.
    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.successful_interactions, 0);
}

#[tokio::test]
async fn explicit_mode_never_falls_back() {
    let named = Scripted::new(ProviderId::Openai, || {
        Err(ProviderError::Unreachable("HTTP 502: bad gateway".into()))
    });
    let bystander = Scripted::new(ProviderId::Anthropic, || {
        Ok(answer("should never be asked"))
    });

    let learner = learner().await;
    let dispatcher = Dispatcher::new(
        vec![named.clone(), bystander.clone()],
        learner.clone(),
        options(),
    );

    let err = dispatcher
        .dispatch(
            DispatchRequest::new("2+2?"),
            DispatchMode::Explicit(ProviderId::Openai),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::ProviderUnavailable {
            provider: ProviderId::Openai,
            ..
        }
    ));
    assert_eq!(named.calls(), 1);
    assert_eq!(bystander.calls(), 0);
}

#[tokio::test]
async fn timed_out_provider_falls_back_and_the_answer_is_learned() {
    // Quick depth ranks ollama ahead of gemini, so the stalled local daemon
    // is attempted first and times out.
    let slow = Scripted::new(ProviderId::Ollama, || Ok(stalled()));
    let healthy = Scripted::new(ProviderId::Gemini, || Ok(answer("4")));

    let learner = learner().await;
    let dispatcher = Dispatcher::new(
        vec![slow.clone(), healthy.clone()],
        learner.clone(),
        options(),
    );

    let stream = dispatcher
        .dispatch(
            DispatchRequest::new("2+2?").with_depth(Depth::Quick),
            DispatchMode::Auto,
        )
        .await
        .unwrap();
    assert_eq!(stream.provider(), ProviderId::Gemini);

    let collected = stream.collect().await;
    assert_eq!(collected.response, "4");
    assert!(collected.error.is_none());
    assert_eq!(slow.calls(), 1);
    assert_eq!(healthy.calls(), 1);

    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.successful_interactions, 1);

    // One fallback hop, one interaction, one pattern bump per tag.
    let chat = learner.patterns_for("chat").expect("chat pattern");
    assert_eq!(chat.occurrences, 1);
    assert!((chat.success_rate - 1.0).abs() < 1e-12);
    let quick = learner.patterns_for("quick").expect("depth pattern");
    assert_eq!(quick.occurrences, 1);
}

#[tokio::test]
async fn explicit_malformed_response_is_surfaced_and_recorded() {
    // HTTP 200 with zero events counts as malformed.
    let empty = Scripted::new(ProviderId::Openai, || Ok(events(vec![])));

    let learner = learner().await;
    let dispatcher = Dispatcher::new(vec![empty.clone()], learner.clone(), options());

    let err = dispatcher
        .dispatch(
            DispatchRequest::new("2+2?").with_tags(vec!["math".into()]),
            DispatchMode::Explicit(ProviderId::Openai),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::ProviderMalformedResponse {
            provider: ProviderId::Openai,
            ..
        }
    ));
    assert_eq!(empty.calls(), 1);

    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.successful_interactions, 0);

    let math = learner.patterns_for("math").expect("math pattern");
    assert_eq!(math.occurrences, 1);
    assert!((math.success_rate - 0.0).abs() < 1e-12);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_a_trailing_error_event() {
    let flaky = Scripted::new(ProviderId::Anthropic, || {
        Ok(events(vec![
            Ok(ProviderEvent::Step(ReasoningStep {
                index: 1,
                thought: "compute the sum".into(),
                confidence: 0.87,
            })),
            Ok(ProviderEvent::Content("partial".into())),
            Err(ProviderError::Unreachable("connection reset".into())),
        ]))
    });

    let learner = learner().await;
    let dispatcher = Dispatcher::new(vec![flaky], learner.clone(), options());

    let mut stream = dispatcher
        .dispatch(
            DispatchRequest::new("2+2?"),
            DispatchMode::Explicit(ProviderId::Anthropic),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = stream.next().await {
        seen.push(event);
    }

    assert_eq!(seen.len(), 3);
    assert!(matches!(&seen[0], StreamEvent::Step(step) if step.index == 1));
    assert!(matches!(&seen[1], StreamEvent::Content(text) if text == "partial"));
    match &seen[2] {
        StreamEvent::Error(failure) => {
            assert_eq!(failure.provider, "anthropic");
            assert!(failure.message.contains("connection reset"));
        }
        other => panic!("expected trailing error event, got {other:?}"),
    }

    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.successful_interactions, 0);
}

#[tokio::test]
async fn abandoning_the_stream_records_a_canceled_interaction() {
    // One fragment, then silence: the consumer walks away mid-answer.
    let trickle = Scripted::new(ProviderId::Gemini, || {
        let opening = stream::iter(vec![Ok(ProviderEvent::Content("The answer".to_string()))]);
        Ok(Box::pin(opening.chain(stream::pending())) as EventStream)
    });

    let learner = learner().await;
    let dispatcher = Dispatcher::new(vec![trickle], learner.clone(), options());

    let mut stream = dispatcher
        .dispatch(
            DispatchRequest::new("what is the answer to everything?"),
            DispatchMode::Explicit(ProviderId::Gemini),
        )
        .await
        .unwrap();
    let interaction_id = stream.interaction_id().to_string();

    let first = stream.next().await;
    assert!(matches!(first, Some(StreamEvent::Content(_))));
    drop(stream);

    wait_for_records(&learner, 1).await;

    let interaction = learner
        .interaction(&interaction_id)
        .await
        .unwrap()
        .expect("canceled interaction recorded");
    assert!(!interaction.success);
    assert_eq!(interaction.feedback.as_deref(), Some("canceled"));
    assert_eq!(interaction.response, "The answer");
}

#[tokio::test]
async fn events_arrive_in_producer_order() {
    let stepped = Scripted::new(ProviderId::Openai, || {
        Ok(events(vec![
            Ok(ProviderEvent::Step(ReasoningStep {
                index: 1,
                thought: "first".into(),
                confidence: 0.85,
            })),
            Ok(ProviderEvent::Content("a".into())),
            Ok(ProviderEvent::Step(ReasoningStep {
                index: 2,
                thought: "second".into(),
                confidence: 0.85,
            })),
            Ok(ProviderEvent::Content("b".into())),
        ]))
    });

    let learner = learner().await;
    let dispatcher = Dispatcher::new(vec![stepped], learner, options());

    let collected = dispatcher
        .dispatch(
            DispatchRequest::new("spell ab"),
            DispatchMode::Explicit(ProviderId::Openai),
        )
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(collected.response, "ab");
    assert_eq!(collected.steps.len(), 2);
    assert_eq!(collected.steps[0].index, 1);
    assert_eq!(collected.steps[1].index, 2);
    assert!(collected.error.is_none());
}

#[tokio::test]
async fn broken_store_never_reaches_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interactions.db");
    let learner = Arc::new(Learner::open(&path).await.unwrap());

    // Yank the log table out from under the learner mid-flight.
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("DROP TABLE interactions;")
        .unwrap();

    let healthy = Scripted::new(ProviderId::Gemini, || Ok(answer("4")));
    let dispatcher = Dispatcher::new(vec![healthy.clone()], learner.clone(), options());

    let collected = dispatcher
        .dispatch(
            DispatchRequest::new("2+2?"),
            DispatchMode::Explicit(ProviderId::Gemini),
        )
        .await
        .unwrap()
        .collect()
        .await;

    // The lost record is telemetry only: the answer arrives intact with no
    // trailing error event.
    assert_eq!(collected.response, "4");
    assert!(collected.error.is_none());
    assert_eq!(healthy.calls(), 1);

    // Only an explicit store operation surfaces the failure.
    assert!(matches!(
        learner.stats().await,
        Err(LearnerError::StoreUnavailable(_))
    ));
}

#[tokio::test]
async fn concurrent_dispatches_do_not_stall_each_other() {
    let slow = Scripted::new(ProviderId::Ollama, || Ok(stalled()));
    let fast = Scripted::new(ProviderId::Gemini, || Ok(answer("done")));

    let learner = learner().await;
    let dispatcher = Arc::new(Dispatcher::new(vec![slow, fast], learner, options()));

    // The slow explicit dispatch is still waiting on its first event while
    // the fast one completes.
    let slow_dispatcher = dispatcher.clone();
    let slow_task = tokio::spawn(async move {
        slow_dispatcher
            .dispatch(
                DispatchRequest::new("hang"),
                DispatchMode::Explicit(ProviderId::Ollama),
            )
            .await
    });

    let fast_result = tokio::time::timeout(
        Duration::from_millis(150),
        dispatcher.dispatch(
            DispatchRequest::new("hurry"),
            DispatchMode::Explicit(ProviderId::Gemini),
        ),
    )
    .await
    .expect("fast dispatch blocked behind the slow one")
    .unwrap();
    assert_eq!(fast_result.collect().await.response, "done");

    let slow_result = slow_task.await.unwrap();
    assert!(matches!(
        slow_result,
        Err(DispatchError::ProviderUnavailable {
            provider: ProviderId::Ollama,
            ..
        })
    ));
}
