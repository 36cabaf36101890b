//! Hybrid search: lexical and vector subtracks fused by reciprocal rank.
//!
//! The two subtracks run concurrently with independent deadlines. A
//! subtrack failure is tolerated silently when the other channel still
//! has results or when the mode does not require it; a mode that forces a
//! single subtrack propagates that subtrack's failure.
//!
//! # Fusion (mode = hybrid)
//!
//! Candidates are keyed by chunk id when present, else
//! `resource_id:filepath:line_start`. Each channel contributes a
//! reciprocal-rank score `1/(K+rank)` (1-based rank, K = 60); the final
//! score is `α·vector + (1-α)·text`. Ties keep insertion order.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk_store::ChunkStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    ContentStatus, MatchType, Resource, SearchMode, SearchOptions, SearchResult, VectorStatus,
    RRF_K,
};
use crate::providers::Capabilities;
use crate::repo::Materializer;
use crate::resources::ResourceStore;
use crate::text_search::TextSearch;

pub struct SearchEngine {
    resources: ResourceStore,
    chunks: ChunkStore,
    text: TextSearch,
    materializer: Arc<Materializer>,
    subtrack_timeout: Duration,
}

impl SearchEngine {
    #[must_use]
    pub fn new(pool: &SqlitePool, config: &Config, materializer: Arc<Materializer>) -> Self {
        Self {
            resources: ResourceStore::new(pool.clone()),
            chunks: ChunkStore::new(pool.clone()),
            text: TextSearch::new(&config.search),
            materializer,
            subtrack_timeout: Duration::from_secs(config.search.subtrack_timeout_secs),
        }
    }

    /// Run a query for `owner` over the visible resources.
    ///
    /// An empty query returns an empty result without touching either
    /// subtrack. Alpha and top-k are clamped.
    pub async fn search(
        &self,
        owner: Option<&str>,
        opts: SearchOptions,
        caps: &Capabilities,
    ) -> Result<Vec<SearchResult>> {
        let opts = opts.clamped();
        let query = opts.query.trim().to_string();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let visible = self.resources.list(owner, &opts.resource_ids).await?;

        let text_scopes: Vec<(Resource, PathBuf)> = visible
            .iter()
            .filter(|r| r.content_status == ContentStatus::Ready)
            .filter_map(|r| {
                self.materializer
                    .content_root(r)
                    .ok()
                    .map(|root| (r.clone(), root))
            })
            .collect();
        let vector_ids: Vec<String> = visible
            .iter()
            .filter(|r| r.vector_status == VectorStatus::Ready)
            .map(|r| r.id.clone())
            .collect();

        let run_text = opts.mode != SearchMode::Vector;
        let run_vector = opts.mode != SearchMode::Text;

        let text_fut = async {
            if !run_text {
                return Ok(Vec::new());
            }
            tokio::time::timeout(self.subtrack_timeout, self.text.search(&text_scopes, &query))
                .await
                .map_err(|_| Error::Timeout("text subtrack".to_string()))?
        };

        let vector_fut = async {
            if !run_vector {
                return Ok(Vec::new());
            }
            tokio::time::timeout(self.subtrack_timeout, async {
                let query_vec = caps.embedder.embed_one(&query).await?;
                let candidates = self
                    .chunks
                    .nearest(&query_vec, &vector_ids, opts.top_k * 4)
                    .await?;
                Ok::<_, Error>(
                    candidates
                        .into_iter()
                        .map(|c| SearchResult {
                            chunk_id: Some(c.chunk_id),
                            resource_id: c.resource_id,
                            resource_name: c.resource_name,
                            filepath: c.filepath,
                            line_start: c.line_start,
                            line_end: c.line_end,
                            text: c.text,
                            score: 1.0 - c.distance,
                            match_type: MatchType::Vector,
                            match_sources: vec!["vector".to_string()],
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .await
            .map_err(|_| Error::Timeout("vector subtrack".to_string()))?
        };

        let (text_outcome, vector_outcome) = tokio::join!(text_fut, vector_fut);

        match opts.mode {
            SearchMode::Text => {
                let mut results = text_outcome?;
                results.truncate(opts.top_k);
                Ok(results)
            }
            SearchMode::Vector => {
                let mut results = vector_outcome?;
                results.truncate(opts.top_k);
                Ok(results)
            }
            SearchMode::Hybrid => match (text_outcome, vector_outcome) {
                (Ok(text), Ok(vector)) => Ok(fuse(&text, &vector, opts.alpha, opts.top_k)),
                (Ok(text), Err(e)) => {
                    if text.is_empty() {
                        Err(e)
                    } else {
                        tracing::warn!("vector subtrack failed, serving text only: {e}");
                        Ok(fuse(&text, &[], opts.alpha, opts.top_k))
                    }
                }
                (Err(e), Ok(vector)) => {
                    if vector.is_empty() {
                        Err(e)
                    } else {
                        tracing::warn!("text subtrack failed, serving vector only: {e}");
                        Ok(fuse(&[], &vector, opts.alpha, opts.top_k))
                    }
                }
                (Err(e), Err(_)) => Err(e),
            },
        }
    }
}

struct FusedEntry {
    result: SearchResult,
    text_rank: Option<usize>,
    vector_rank: Option<usize>,
}

fn positional_key(result: &SearchResult) -> String {
    format!(
        "{}:{}:{}",
        result.resource_id, result.filepath, result.line_start
    )
}

/// Reciprocal-rank fusion of the two channels.
///
/// Entries are keyed by chunk id when present, else by position. Text
/// windows never carry a chunk id, so a positional side-index joins a
/// vector chunk with the text window that starts on the same line.
#[must_use]
pub fn fuse(
    text: &[SearchResult],
    vector: &[SearchResult],
    alpha: f64,
    top_k: usize,
) -> Vec<SearchResult> {
    let mut entries: HashMap<String, FusedEntry> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    // `resource:filepath:line_start` → primary key of the entry.
    let mut positional: HashMap<String, String> = HashMap::new();

    for (i, result) in text.iter().enumerate() {
        let key = result.fusion_key();
        if entries.contains_key(&key) {
            continue;
        }
        positional.insert(positional_key(result), key.clone());
        order.push(key.clone());
        entries.insert(
            key,
            FusedEntry {
                result: result.clone(),
                text_rank: Some(i + 1),
                vector_rank: None,
            },
        );
    }

    for (i, result) in vector.iter().enumerate() {
        let rank = i + 1;
        let key = result.fusion_key();
        let resolved = if entries.contains_key(&key) {
            key
        } else if let Some(existing) = positional.get(&positional_key(result)) {
            existing.clone()
        } else {
            positional.insert(positional_key(result), key.clone());
            order.push(key.clone());
            entries.insert(
                key.clone(),
                FusedEntry {
                    result: result.clone(),
                    text_rank: None,
                    vector_rank: Some(rank),
                },
            );
            continue;
        };

        if let Some(entry) = entries.get_mut(&resolved) {
            // A key seen in both channels (or twice in the vector
            // channel) keeps its best vector rank.
            entry.vector_rank = Some(entry.vector_rank.map_or(rank, |r| r.min(rank)));
            if entry.result.chunk_id.is_none() {
                entry.result.chunk_id = result.chunk_id.clone();
            }
        }
    }

    let mut fused: Vec<SearchResult> = Vec::with_capacity(order.len());
    for key in &order {
        let Some(entry) = entries.remove(key) else {
            continue;
        };
        let text_score = entry.text_rank.map_or(0.0, |r| 1.0 / (RRF_K + r as f64));
        let vector_score = entry.vector_rank.map_or(0.0, |r| 1.0 / (RRF_K + r as f64));

        let mut result = entry.result;
        result.score = alpha * vector_score + (1.0 - alpha) * text_score;
        (result.match_type, result.match_sources) =
            match (entry.text_rank.is_some(), entry.vector_rank.is_some()) {
                (true, true) => (
                    MatchType::Hybrid,
                    vec!["text".to_string(), "vector".to_string()],
                ),
                (true, false) => (MatchType::Text, vec!["text".to_string()]),
                (false, _) => (MatchType::Vector, vec!["vector".to_string()]),
            };
        fused.push(result);
    }

    // Stable: equal scores keep insertion order (text channel first).
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, line_start: i64) -> SearchResult {
        SearchResult {
            chunk_id: None,
            resource_id: "r1".to_string(),
            resource_name: "demo".to_string(),
            filepath: key.to_string(),
            line_start,
            line_end: line_start + 5,
            text: format!("body of {key}"),
            score: 0.0,
            match_type: MatchType::Text,
            match_sources: vec!["text".to_string()],
        }
    }

    #[test]
    fn fusion_matches_worked_example() {
        // Text: T1, T2, T3. Vector: V1 = T2, V2, V3. K = 60, alpha = 0.5.
        let t1 = candidate("t1", 1);
        let t2 = candidate("t2", 1);
        let t3 = candidate("t3", 1);
        let v1 = candidate("t2", 1); // same key as T2
        let v2 = candidate("v2", 1);
        let v3 = candidate("v3", 1);

        let fused = fuse(
            &[t1.clone(), t2.clone(), t3.clone()],
            &[v1, v2, v3],
            0.5,
            3,
        );
        assert_eq!(fused.len(), 3);

        // T2 leads: it contributed from both channels.
        assert_eq!(fused[0].filepath, "t2");
        assert_eq!(fused[0].match_type, MatchType::Hybrid);
        assert_eq!(fused[0].match_sources, vec!["text", "vector"]);
        let expected_t2 = 0.5 * (1.0 / 61.0) + 0.5 * (1.0 / 62.0);
        assert!((fused[0].score - expected_t2).abs() < 1e-12);

        // T1 (text rank 1) and V2 (vector rank 2) fill the remaining slots.
        let rest: Vec<&str> = fused[1..].iter().map(|r| r.filepath.as_str()).collect();
        assert!(rest.contains(&"t1"));
        assert!(rest.contains(&"v2"));
        assert!((fused[1].score - 0.5 * (1.0 / 61.0)).abs() < 1e-12);
        assert!((fused[2].score - 0.5 * (1.0 / 62.0)).abs() < 1e-12);
    }

    #[test]
    fn fusion_tie_break_is_insertion_order() {
        // alpha = 0.5 makes text rank 1 and vector rank 1 score equally;
        // the text-channel entry was inserted first and stays first.
        let fused = fuse(&[candidate("from-text", 1)], &[candidate("from-vector", 1)], 0.5, 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].filepath, "from-text");
        assert_eq!(fused[1].filepath, "from-vector");
    }

    #[test]
    fn fusion_alpha_extremes() {
        let text = vec![candidate("t", 1)];
        let vector = vec![candidate("v", 1)];

        let fused = fuse(&text, &vector, 0.0, 10);
        assert_eq!(fused[0].filepath, "t");
        assert_eq!(fused[1].score, 0.0);

        let fused = fuse(&text, &vector, 1.0, 10);
        assert_eq!(fused[0].filepath, "v");
        assert_eq!(fused[1].score, 0.0);
    }

    #[test]
    fn fusion_keeps_best_vector_rank_for_duplicates() {
        let dup_a = candidate("dup", 1);
        let dup_b = candidate("dup", 1);
        let fused = fuse(&[], &[dup_a, candidate("other", 1), dup_b], 1.0, 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].filepath, "dup");
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn fusion_truncates_to_top_k() {
        let text: Vec<SearchResult> = (0..10).map(|i| candidate(&format!("t{i}"), 1)).collect();
        let fused = fuse(&text, &[], 0.5, 3);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].filepath, "t0");
    }

    #[test]
    fn vector_chunk_joins_text_window_positionally() {
        // A text window (no chunk id) and a vector chunk starting on the
        // same line of the same file fuse into one hybrid entry, and the
        // chunk id is backfilled.
        let text = vec![candidate("src/auth.rs", 1)];
        let mut vector = vec![candidate("src/auth.rs", 1)];
        vector[0].chunk_id = Some("c-9".to_string());

        let fused = fuse(&text, &vector, 0.5, 10);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].match_type, MatchType::Hybrid);
        assert_eq!(fused[0].chunk_id.as_deref(), Some("c-9"));
        assert_eq!(fused[0].match_sources, vec!["text", "vector"]);
    }
}
