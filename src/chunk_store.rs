//! Persisted chunks: transactional replacement and vector search.
//!
//! Embeddings are stored as little-endian `f32` BLOBs. Nearest-neighbour
//! lookup is a cosine scan over rows with non-null embeddings, restricted
//! to the caller's resource set. Chunk replacement is a delete-then-insert
//! inside a single transaction, so readers observe either the old set or
//! the new set, never a mix.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunker::DraftChunk;
use crate::error::Result;
use crate::models::Chunk;

/// A chunk prepared for insertion, with its (possibly absent) vector.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub draft: DraftChunk,
    pub embedding: Option<Vec<f32>>,
}

/// A vector-search candidate.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub filepath: String,
    pub line_start: i64,
    pub line_end: i64,
    pub text: String,
    /// Cosine distance, ascending = closer.
    pub distance: f64,
}

#[derive(Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
}

impl ChunkStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete all chunks of a resource and insert `batch`, atomically.
    /// Called with the first batch of an index run (or an empty batch when
    /// the run produced nothing — the delete still happens).
    pub async fn replace_with(&self, resource_id: &str, batch: &[NewChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        for chunk in batch {
            insert_chunk(&mut tx, resource_id, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Insert a follow-up batch of the same index run.
    pub async fn append(&self, resource_id: &str, batch: &[NewChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in batch {
            insert_chunk(&mut tx, resource_id, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self, resource_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Nearest neighbours under cosine distance, restricted to the given
    /// resources and to rows with embeddings. Ordered ascending by
    /// distance; ties broken by chunk id for determinism.
    pub async fn nearest(
        &self,
        query: &[f32],
        resource_ids: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if resource_ids.is_empty() || query.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; resource_ids.len()].join(", ");
        let sql = format!(
            "SELECT c.id, c.resource_id, r.name AS resource_name, c.filepath, \
                    c.line_start, c.line_end, c.text, c.embedding \
             FROM chunks c JOIN resources r ON r.id = c.resource_id \
             WHERE c.embedding IS NOT NULL AND c.resource_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for id in resource_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let distance = 1.0 - f64::from(cosine_similarity(query, &vector));
            scored.push(ScoredChunk {
                chunk_id: row.get("id"),
                resource_id: row.get("resource_id"),
                resource_name: row.get("resource_name"),
                filepath: row.get("filepath"),
                line_start: row.get("line_start"),
                line_end: row.get("line_end"),
                text: row.get("text"),
                distance,
            });
        }

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// All chunks of a resource, ordered by filepath and line.
    pub async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE resource_id = ? ORDER BY filepath, line_start",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                Chunk {
                    id: row.get("id"),
                    resource_id: row.get("resource_id"),
                    filepath: row.get("filepath"),
                    line_start: row.get("line_start"),
                    line_end: row.get("line_end"),
                    text: row.get("text"),
                    contextualized_text: row.get("contextualized_text"),
                    scope: row.get("scope"),
                    entities: row.get("entities"),
                    language: row.get("language"),
                    hash: row.get("hash"),
                    embedding: blob.as_deref().map(blob_to_vec),
                }
            })
            .collect())
    }
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    resource_id: &str,
    chunk: &NewChunk,
) -> Result<()> {
    let blob = chunk.embedding.as_deref().map(vec_to_blob);
    sqlx::query(
        r#"
        INSERT INTO chunks
            (id, resource_id, filepath, line_start, line_end, text,
             contextualized_text, scope, entities, language, hash, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(resource_id)
    .bind(&chunk.draft.filepath)
    .bind(chunk.draft.line_start)
    .bind(chunk.draft.line_end)
    .bind(&chunk.draft.text)
    .bind(&chunk.draft.contextualized_text)
    .bind(&chunk.draft.scope)
    .bind(&chunk.draft.entities)
    .bind(&chunk.draft.language)
    .bind(&chunk.draft.hash)
    .bind(blob)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Encode a float vector as little-endian `f32` bytes.
#[must_use]
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
#[must_use]
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
