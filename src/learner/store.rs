//! SQLite persistence for interactions and pattern aggregates.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::cosine_similarity;
use crate::types::{Interaction, Pattern};

/// Outcome fields replayed into the pattern book when a store is opened.
#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub query: String,
    pub success: bool,
    pub tags: Vec<String>,
}

/// SQLite-backed interaction store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;

        // WAL keeps readers unblocked while a record lands.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Interaction log; append-only apart from feedback updates
            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                response TEXT NOT NULL,
                success INTEGER NOT NULL,
                feedback TEXT,
                timestamp TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                embedding BLOB
            );

            -- Materialized pattern aggregates, one row per tag
            CREATE TABLE IF NOT EXISTS patterns (
                pattern_type TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                occurrences INTEGER NOT NULL,
                success_rate REAL NOT NULL,
                examples TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_timestamp ON interactions(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_interactions_success ON interactions(success);
        "#,
        )?;

        Ok(())
    }

    /// Insert one interaction row.
    pub async fn append_interaction(&self, interaction: &Interaction) -> Result<()> {
        let conn = self.conn.lock().await;

        let tags_json = serde_json::to_string(&interaction.tags)?;
        let embedding_blob = interaction.embedding.as_deref().map(embedding_to_blob);

        conn.execute(
            r#"INSERT INTO interactions
               (id, query, response, success, feedback, timestamp, tags, embedding)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                interaction.id,
                interaction.query,
                interaction.response,
                interaction.success,
                interaction.feedback,
                interaction.timestamp.to_rfc3339(),
                tags_json,
                embedding_blob,
            ],
        )?;

        Ok(())
    }

    /// Overwrite the outcome fields of one interaction. Returns false when
    /// no row matches the id.
    pub async fn update_feedback(
        &self,
        id: &str,
        success: bool,
        feedback: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;

        let rows = conn.execute(
            "UPDATE interactions SET success = ?2, feedback = ?3 WHERE id = ?1",
            params![id, success, feedback],
        )?;

        Ok(rows > 0)
    }

    /// Load one interaction by id.
    pub async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, query, response, success, feedback, timestamp, tags, embedding
             FROM interactions WHERE id = ?1",
        )?;

        let result = stmt
            .query_row(params![id], row_to_interaction)
            .optional()?;

        Ok(result)
    }

    /// Newest interactions first.
    pub async fn recent_interactions(&self, limit: usize) -> Result<Vec<Interaction>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, query, response, success, feedback, timestamp, tags, embedding
             FROM interactions
             ORDER BY rowid DESC
             LIMIT ?1",
        )?;

        let records = stmt
            .query_map(params![limit], row_to_interaction)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Total and successful interaction counts.
    pub async fn count_interactions(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock().await;

        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        let successes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM interactions WHERE success = 1",
            [],
            |row| row.get(0),
        )?;

        Ok((total as u64, successes as u64))
    }

    /// Every recorded outcome in insertion order, for pattern replay.
    pub async fn load_outcomes(&self) -> Result<Vec<InteractionOutcome>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare_cached("SELECT query, success, tags FROM interactions ORDER BY rowid ASC")?;

        let outcomes = stmt
            .query_map([], |row| {
                let query: String = row.get(0)?;
                let success: bool = row.get(1)?;
                let tags_json: String = row.get(2)?;
                Ok(InteractionOutcome {
                    query,
                    success,
                    tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(outcomes)
    }

    /// Write a pattern snapshot. The guard ignores snapshots older than
    /// what the row already holds, so concurrent writers cannot roll a
    /// pattern backwards.
    pub async fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        let conn = self.conn.lock().await;

        let examples_json = serde_json::to_string(&pattern.examples)?;

        conn.execute(
            r#"INSERT INTO patterns
               (pattern_type, description, occurrences, success_rate, examples, confidence)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(pattern_type) DO UPDATE SET
                   description = excluded.description,
                   occurrences = excluded.occurrences,
                   success_rate = excluded.success_rate,
                   examples = excluded.examples,
                   confidence = excluded.confidence
               WHERE excluded.occurrences > patterns.occurrences"#,
            params![
                pattern.pattern_type,
                pattern.description,
                pattern.occurrences as i64,
                pattern.success_rate,
                examples_json,
                pattern.confidence,
            ],
        )?;

        Ok(())
    }

    /// Load one materialized pattern by tag.
    pub async fn load_pattern(&self, tag: &str) -> Result<Option<Pattern>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT pattern_type, description, occurrences, success_rate, examples, confidence
             FROM patterns WHERE pattern_type = ?1",
        )?;

        let result = stmt.query_row(params![tag], row_to_pattern).optional()?;

        Ok(result)
    }

    /// All materialized patterns, most confident first.
    pub async fn load_patterns(&self) -> Result<Vec<Pattern>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT pattern_type, description, occurrences, success_rate, examples, confidence
             FROM patterns
             ORDER BY confidence DESC, pattern_type ASC",
        )?;

        let records = stmt
            .query_map([], row_to_pattern)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Nearest stored interactions by embedding cosine similarity.
    pub async fn similar_by_embedding(
        &self,
        query: &[f32],
        limit: usize,
        success_only: bool,
    ) -> Result<Vec<(Interaction, f32)>> {
        let conn = self.conn.lock().await;

        // Pre-filter to recent rows that carry an embedding.
        let mut stmt = conn.prepare_cached(
            r#"SELECT id, query, response, success, feedback, timestamp, tags, embedding
               FROM interactions
               WHERE embedding IS NOT NULL
               ORDER BY rowid DESC
               LIMIT 1000"#,
        )?;

        let records = stmt
            .query_map([], row_to_interaction)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut results: Vec<(Interaction, f32)> = records
            .into_iter()
            .filter(|i| !success_only || i.success)
            .filter_map(|interaction| {
                let similarity =
                    cosine_similarity(query, interaction.embedding.as_deref().unwrap_or(&[]));
                (similarity > 0.1).then_some((interaction, similarity))
            })
            .collect();

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }
}

fn row_to_interaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Interaction> {
    let id: String = row.get(0)?;
    let query: String = row.get(1)?;
    let response: String = row.get(2)?;
    let success: bool = row.get(3)?;
    let feedback: Option<String> = row.get(4)?;
    let timestamp_str: String = row.get(5)?;
    let tags_json: String = row.get(6)?;
    let embedding_blob: Option<Vec<u8>> = row.get(7)?;

    Ok(Interaction {
        id,
        query,
        response,
        success,
        feedback,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        embedding: embedding_blob.as_deref().map(blob_to_embedding),
    })
}

fn row_to_pattern(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pattern> {
    let pattern_type: String = row.get(0)?;
    let description: String = row.get(1)?;
    let occurrences: i64 = row.get(2)?;
    let success_rate: f64 = row.get(3)?;
    let examples_json: String = row.get(4)?;
    let confidence: f64 = row.get(5)?;

    Ok(Pattern {
        pattern_type,
        description,
        occurrences: occurrences as u64,
        success_rate,
        examples: serde_json::from_str(&examples_json).unwrap_or_default(),
        confidence,
    })
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    let len = blob.len() / 4;
    let mut embedding = Vec::with_capacity(len);
    for i in 0..len {
        let bytes = &blob[i * 4..(i + 1) * 4];
        let val = f32::from_le_bytes(bytes.try_into().unwrap_or([0; 4]));
        embedding.push(val);
    }
    embedding
}
