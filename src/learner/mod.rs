//! Interaction learning: a durable log of request outcomes plus live
//! pattern aggregates derived from it.
//!
//! The SQLite log is the source of truth; the [`PatternBook`] is rebuilt
//! from it at open and folded forward on every record. Pattern rows in the
//! database are a materialization for external readers and recover on the
//! next write if one lands stale.

pub mod patterns;
pub mod store;

pub use patterns::PatternBook;
pub use store::SqliteStore;

use std::path::Path;
use tracing::{debug, warn};

use crate::types::{Interaction, LearningStats, Pattern};

/// Learner failures callers are expected to branch on.
#[derive(Debug, thiserror::Error)]
pub enum LearnerError {
    #[error("no interaction with id '{0}'")]
    NotFound(String),
    #[error("interaction store unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),
}

/// Records interactions and answers pattern/stats queries.
pub struct Learner {
    store: SqliteStore,
    book: PatternBook,
}

impl Learner {
    /// Open the learner over the database at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, LearnerError> {
        let store = SqliteStore::open(path).await?;
        Self::with_store(store).await
    }

    /// Learner over an in-memory database. Nothing survives the process.
    pub async fn open_in_memory() -> Result<Self, LearnerError> {
        let store = SqliteStore::open_in_memory()?;
        Self::with_store(store).await
    }

    async fn with_store(store: SqliteStore) -> Result<Self, LearnerError> {
        let book = PatternBook::new();
        let outcomes = store.load_outcomes().await?;
        let replayed = outcomes.len();
        for outcome in outcomes {
            for tag in dedup_tags(&outcome.tags) {
                book.apply(tag, outcome.success, &outcome.query);
            }
        }
        if replayed > 0 {
            debug!(
                interactions = replayed,
                patterns = book.len(),
                "pattern book rebuilt"
            );
        }
        Ok(Self { store, book })
    }

    /// Record one interaction: append it to the log, fold it into the
    /// pattern book, and refresh the materialized pattern rows.
    pub async fn record(&self, interaction: Interaction) -> Result<(), LearnerError> {
        self.store.append_interaction(&interaction).await?;

        for tag in dedup_tags(&interaction.tags) {
            let snapshot = self
                .book
                .apply(tag, interaction.success, &interaction.query);
            if let Err(err) = self.store.upsert_pattern(&snapshot).await {
                warn!(tag, error = %err, "pattern row not materialized");
            }
        }

        Ok(())
    }

    /// Revise the outcome of a stored interaction. The durable row changes;
    /// already-folded pattern counters do not.
    pub async fn apply_feedback(
        &self,
        id: &str,
        success: bool,
        feedback: Option<&str>,
    ) -> Result<(), LearnerError> {
        let updated = self.store.update_feedback(id, success, feedback).await?;
        if !updated {
            return Err(LearnerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Snapshot of totals and the strongest strategies. Counts come from
    /// the durable log, so late feedback shows up here.
    pub async fn stats(&self) -> Result<LearningStats, LearnerError> {
        let (total, successes) = self.store.count_interactions().await?;
        let success_rate = if total == 0 {
            0.0
        } else {
            successes as f64 / total as f64
        };
        Ok(LearningStats {
            total_interactions: total,
            successful_interactions: successes,
            success_rate,
            patterns_identified: self.book.len() as u64,
            top_success_strategies: self.book.top_strategies(5),
        })
    }

    /// Aggregate for one tag, if any interaction has carried it.
    pub fn patterns_for(&self, tag: &str) -> Option<Pattern> {
        self.book.get(tag)
    }

    /// All patterns, most confident first.
    pub fn patterns(&self) -> Vec<Pattern> {
        self.book.all()
    }

    /// Load one interaction by id.
    pub async fn interaction(&self, id: &str) -> Result<Option<Interaction>, LearnerError> {
        Ok(self.store.get_interaction(id).await?)
    }

    /// Newest interactions first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Interaction>, LearnerError> {
        Ok(self.store.recent_interactions(limit).await?)
    }

    /// Nearest stored interactions by embedding similarity.
    pub async fn find_similar(
        &self,
        embedding: &[f32],
        limit: usize,
        success_only: bool,
    ) -> Result<Vec<(Interaction, f32)>, LearnerError> {
        Ok(self
            .store
            .similar_by_embedding(embedding, limit, success_only)
            .await?)
    }

    /// Liveness probe for health endpoints.
    pub async fn store_healthy(&self) -> bool {
        self.store.count_interactions().await.is_ok()
    }
}

/// Trimmed, deduplicated tags. An interaction tagged `["math", "math"]`
/// counts once toward the `math` pattern.
fn dedup_tags(tags: &[String]) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() || seen.contains(&tag) {
            continue;
        }
        seen.push(tag);
    }
    seen
}

/// Cosine similarity between two vectors; 0.0 on dimension mismatch or a
/// zero-magnitude side.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
