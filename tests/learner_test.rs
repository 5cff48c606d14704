//! Exactness, concurrency, and persistence properties of the learner.

use std::sync::Arc;
use tempfile::tempdir;

use polymind::learner::{Learner, LearnerError};
use polymind::types::Interaction;

fn interaction(query: &str, success: bool, tags: &[&str]) -> Interaction {
    Interaction::new(
        query,
        if success { "right" } else { "wrong" },
        success,
        tags.iter().map(|t| t.to_string()).collect(),
    )
}

#[tokio::test]
async fn concurrent_records_are_counted_exactly_once() {
    let learner = Arc::new(Learner::open_in_memory().await.unwrap());

    // 16 writers × 25 records, alternating outcomes, all on one tag: the
    // per-row lock must lose nothing and double-count nothing.
    let mut handles = Vec::new();
    for writer in 0..16u64 {
        let learner = learner.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25u64 {
                let success = (writer + i) % 2 == 0;
                learner
                    .record(interaction("load test", success, &["load"]))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 400);
    assert_eq!(stats.successful_interactions, 200);
    assert!((stats.success_rate - 0.5).abs() < 1e-12);

    let pattern = learner.patterns_for("load").unwrap();
    assert_eq!(pattern.occurrences, 400);
    assert!((pattern.success_rate - 0.5).abs() < 1e-12);
}

#[tokio::test]
async fn running_mean_matches_full_recomputation() {
    let learner = Learner::open_in_memory().await.unwrap();
    let outcomes = [true, true, false, true, false, false, true, true, true, false];

    let mut successes = 0u64;
    for (n, &success) in outcomes.iter().enumerate() {
        learner
            .record(interaction(&format!("q{n}"), success, &["math"]))
            .await
            .unwrap();
        if success {
            successes += 1;
        }

        let pattern = learner.patterns_for("math").unwrap();
        let expected = successes as f64 / (n + 1) as f64;
        assert_eq!(pattern.occurrences, (n + 1) as u64);
        assert!(
            (pattern.success_rate - expected).abs() < 1e-12,
            "running mean drifted at n={}",
            n + 1
        );
    }
}

#[tokio::test]
async fn confidence_never_decreases_as_evidence_grows() {
    let learner = Learner::open_in_memory().await.unwrap();

    let mut last = 0.0;
    for n in 0..50 {
        learner
            .record(interaction(&format!("q{n}"), true, &["steady"]))
            .await
            .unwrap();
        let pattern = learner.patterns_for("steady").unwrap();
        assert!((0.0..=1.0).contains(&pattern.confidence));
        assert!(
            pattern.confidence >= last,
            "confidence dipped at occurrence {}",
            n + 1
        );
        last = pattern.confidence;
    }
}

#[tokio::test]
async fn one_interaction_updates_each_of_its_tags_once() {
    let learner = Learner::open_in_memory().await.unwrap();
    learner
        .record(interaction("integrate x^2", true, &["math", "calculus"]))
        .await
        .unwrap();

    for tag in ["math", "calculus"] {
        let pattern = learner.patterns_for(tag).unwrap();
        assert_eq!(pattern.occurrences, 1, "tag {tag}");
    }

    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.patterns_identified, 2);
}

#[tokio::test]
async fn stats_are_idempotent_between_mutations() {
    let learner = Learner::open_in_memory().await.unwrap();
    learner
        .record(interaction("2+2?", true, &["math"]))
        .await
        .unwrap();
    learner
        .record(interaction("3+3?", false, &["math"]))
        .await
        .unwrap();

    let first = learner.stats().await.unwrap();
    let second = learner.stats().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn feedback_flips_counts_but_leaves_patterns_alone() {
    let learner = Learner::open_in_memory().await.unwrap();
    let recorded = interaction("2+2?", true, &["math"]);
    let id = recorded.id.clone();
    learner.record(recorded).await.unwrap();

    learner
        .apply_feedback(&id, false, Some("answer was actually wrong"))
        .await
        .unwrap();

    // Exact count-based stats see the flip.
    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.successful_interactions, 0);

    // Pattern aggregates are record-time running statistics.
    let pattern = learner.patterns_for("math").unwrap();
    assert_eq!(pattern.occurrences, 1);
    assert!((pattern.success_rate - 1.0).abs() < 1e-12);

    let stored = learner.interaction(&id).await.unwrap().unwrap();
    assert!(!stored.success);
    assert_eq!(stored.feedback.as_deref(), Some("answer was actually wrong"));
}

#[tokio::test]
async fn feedback_for_an_unknown_id_changes_nothing() {
    let learner = Learner::open_in_memory().await.unwrap();
    learner
        .record(interaction("2+2?", true, &["math"]))
        .await
        .unwrap();
    let before = learner.stats().await.unwrap();

    let err = learner
        .apply_feedback("no-such-id", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LearnerError::NotFound(id) if id == "no-such-id"));

    assert_eq!(learner.stats().await.unwrap(), before);
    assert_eq!(learner.patterns_for("math").unwrap().occurrences, 1);
}

#[tokio::test]
async fn reopening_rebuilds_patterns_from_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("interactions.db");

    {
        let learner = Learner::open(&path).await.unwrap();
        learner
            .record(interaction("2+2?", true, &["math"]))
            .await
            .unwrap();
        learner
            .record(interaction("3*3?", false, &["math"]))
            .await
            .unwrap();
        learner
            .record(interaction("hello", true, &["chat"]))
            .await
            .unwrap();
    }

    let reopened = Learner::open(&path).await.unwrap();
    let stats = reopened.stats().await.unwrap();
    assert_eq!(stats.total_interactions, 3);
    assert_eq!(stats.successful_interactions, 2);
    assert_eq!(stats.patterns_identified, 2);

    let math = reopened.patterns_for("math").unwrap();
    assert_eq!(math.occurrences, 2);
    assert!((math.success_rate - 0.5).abs() < 1e-12);
    assert_eq!(math.examples, vec!["2+2?", "3*3?"]);
}

#[tokio::test]
async fn top_strategies_surface_the_strongest_tags() {
    let learner = Learner::open_in_memory().await.unwrap();
    for i in 0..8 {
        learner
            .record(interaction(&format!("m{i}"), true, &["math"]))
            .await
            .unwrap();
    }
    for i in 0..6 {
        learner
            .record(interaction(&format!("g{i}"), i % 2 == 0, &["geo"]))
            .await
            .unwrap();
    }

    let stats = learner.stats().await.unwrap();
    assert_eq!(stats.top_success_strategies[0].pattern_type, "math");
    assert!((stats.top_success_strategies[0].success_rate - 1.0).abs() < 1e-12);
    assert!(stats.top_success_strategies.len() <= 5);
}

#[tokio::test]
async fn similarity_lookup_orders_by_cosine_and_honors_success_filter() {
    let learner = Learner::open_in_memory().await.unwrap();

    let near = interaction("2+2?", true, &["math"]).with_embedding(vec![1.0, 0.0, 0.0]);
    let close = interaction("2+3?", false, &["math"]).with_embedding(vec![0.9, 0.1, 0.0]);
    let far = interaction("weather?", true, &["chat"]).with_embedding(vec![0.0, 0.0, 1.0]);
    let near_id = near.id.clone();
    let close_id = close.id.clone();

    learner.record(near).await.unwrap();
    learner.record(close).await.unwrap();
    learner.record(far).await.unwrap();

    let query = vec![1.0, 0.0, 0.0];
    let hits = learner.find_similar(&query, 10, false).await.unwrap();
    assert_eq!(hits.len(), 2, "orthogonal embedding should not match");
    assert_eq!(hits[0].0.id, near_id);
    assert_eq!(hits[1].0.id, close_id);
    assert!(hits[0].1 >= hits[1].1);

    let successful_only = learner.find_similar(&query, 10, true).await.unwrap();
    assert_eq!(successful_only.len(), 1);
    assert_eq!(successful_only[0].0.id, near_id);
}
