//! Lexical search: keyword extraction, on-disk grep, and context windows.
//!
//! The text subtrack greps materialized resource trees with a ripgrep
//! subprocess emitting line-delimited JSON, merges nearby hits into
//! ranges, and reconstructs a bounded context window around each range.
//! Scores are reciprocal-rank with a small hit-count bonus:
//! `1/(K+rank) + min(hits,5) × 0.0005`, K = 60.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::models::{MatchType, Resource, SearchResult, RRF_K};

/// Tokens dropped during keyword extraction.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "did", "do", "does",
    "for", "from", "he", "her", "his", "how", "i", "in", "is", "it", "its", "me", "my", "of",
    "on", "or", "our", "she", "should", "that", "the", "their", "them", "they", "this", "to",
    "was", "we", "what", "when", "where", "which", "who", "why", "will", "with", "would", "you",
    "your",
];

/// File patterns excluded from grep: lock files, minified assets, maps,
/// snapshots, and standard build output.
const EXCLUDE_GLOBS: &[&str] = &[
    "!*.lock",
    "!package-lock.json",
    "!yarn.lock",
    "!pnpm-lock.yaml",
    "!*.min.js",
    "!*.min.css",
    "!*.map",
    "!*.snap",
    "!node_modules/**",
    "!dist/**",
    "!build/**",
    "!.next/**",
    "!coverage/**",
    "!.git/**",
];

/// Hits closer than this many lines merge into one range.
const MERGE_GAP: u64 = 10;
/// Context lines added on each side of a merged range.
const CONTEXT_LINES: u64 = 15;
/// Hard cap on a context window, in lines.
const MAX_WINDOW_LINES: u64 = 60;

/// Extract search keywords from a free-form query: split on whitespace,
/// strip edge punctuation, drop short tokens and stop words, dedupe.
#[must_use]
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in query.split_whitespace() {
        let trimmed = token
            .trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
            .to_string();
        if trimmed.len() < 2 {
            continue;
        }
        if STOP_WORDS.contains(&trimmed.to_ascii_lowercase().as_str()) {
            continue;
        }
        if !keywords.contains(&trimmed) {
            keywords.push(trimmed);
        }
    }
    keywords
}

/// One grep hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextHit {
    /// POSIX path relative to the searched root.
    pub filepath: String,
    /// 1-based line number.
    pub line: u64,
}

/// A merged run of nearby hits in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRange {
    pub filepath: String,
    pub line_start: u64,
    pub line_end: u64,
    pub hits: usize,
}

/// Group hits by file, sort by line, and merge hits within [`MERGE_GAP`]
/// lines. The result is ranked by hit count descending (stable).
#[must_use]
pub fn merge_hits(mut hits: Vec<TextHit>) -> Vec<HitRange> {
    hits.sort_by(|a, b| a.filepath.cmp(&b.filepath).then(a.line.cmp(&b.line)));

    let mut ranges: Vec<HitRange> = Vec::new();
    for hit in hits {
        match ranges.last_mut() {
            Some(last)
                if last.filepath == hit.filepath && hit.line <= last.line_end + MERGE_GAP =>
            {
                last.line_end = last.line_end.max(hit.line);
                last.hits += 1;
            }
            _ => ranges.push(HitRange {
                filepath: hit.filepath,
                line_start: hit.line,
                line_end: hit.line,
                hits: 1,
            }),
        }
    }

    ranges.sort_by(|a, b| b.hits.cmp(&a.hits));
    ranges
}

/// Reciprocal-rank score with a capped hit-count bonus. `rank` is 1-based.
#[must_use]
pub fn text_score(rank: usize, hits: usize) -> f64 {
    1.0 / (RRF_K + rank as f64) + (hits.min(5) as f64) * 0.0005
}

/// Grep runner over materialized resource trees.
pub struct TextSearch {
    rg_bin: String,
    max_hits_per_resource: usize,
    timeout: Duration,
}

impl TextSearch {
    #[must_use]
    pub fn new(config: &crate::config::SearchConfig) -> Self {
        Self {
            rg_bin: config.ripgrep_bin.clone(),
            max_hits_per_resource: config.max_hits_per_resource,
            timeout: Duration::from_secs(config.subtrack_timeout_secs),
        }
    }

    /// Run the full text subtrack over `(resource, root)` pairs whose
    /// content is ready. Results are ranked across all resources.
    pub async fn search(
        &self,
        scopes: &[(Resource, std::path::PathBuf)],
        query: &str,
    ) -> Result<Vec<SearchResult>> {
        let keywords = extract_keywords(query);

        let mut ranked: Vec<(usize, HitRange)> = Vec::new();
        for (i, (_, root)) in scopes.iter().enumerate() {
            let hits = self.grep_tree(root, query, &keywords).await?;
            for range in merge_hits(hits) {
                ranked.push((i, range));
            }
        }
        // Global rank: hit count descending, stable across resources.
        ranked.sort_by(|a, b| b.1.hits.cmp(&a.1.hits));

        let mut results = Vec::with_capacity(ranked.len());
        for (rank0, (scope_index, range)) in ranked.iter().enumerate() {
            let (resource, root) = &scopes[*scope_index];
            let Some(window) = context_window(root, range).await else {
                continue;
            };
            results.push(SearchResult {
                chunk_id: None,
                resource_id: resource.id.clone(),
                resource_name: resource.name.clone(),
                filepath: range.filepath.clone(),
                line_start: window.line_start,
                line_end: window.line_end,
                text: window.text,
                score: text_score(rank0 + 1, range.hits),
                match_type: MatchType::Text,
                match_sources: vec!["text".to_string()],
            });
        }
        Ok(results)
    }

    /// Grep one tree. Hit count is capped per resource.
    pub async fn grep_tree(
        &self,
        root: &Path,
        query: &str,
        keywords: &[String],
    ) -> Result<Vec<TextHit>> {
        let mut cmd = Command::new(&self.rg_bin);
        cmd.arg("--json").arg("--smart-case");
        for glob in EXCLUDE_GLOBS {
            cmd.arg("--glob").arg(glob);
        }

        match keywords.len() {
            // No usable keywords: the raw query as a fixed string.
            0 => {
                cmd.arg("--fixed-strings").arg("-e").arg(query);
            }
            1 => {
                cmd.arg("--fixed-strings").arg("-e").arg(&keywords[0]);
            }
            _ => {
                let pattern = keywords
                    .iter()
                    .map(|k| escape_regex(k))
                    .collect::<Vec<_>>()
                    .join("|");
                cmd.arg("-e").arg(pattern);
            }
        }

        cmd.arg(".")
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(format!("{} search", self.rg_bin)))??;

        // Exit code 1 means no matches; anything above is a real failure.
        if !output.status.success() && output.status.code() != Some(1) {
            return Err(Error::Tool {
                command: format!("{} --json", self.rg_bin),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut hits = Vec::new();
        for line in stdout.lines() {
            let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if event.get("type").and_then(|t| t.as_str()) != Some("match") {
                continue;
            }
            let data = &event["data"];
            let Some(path) = data["path"]["text"].as_str() else {
                continue;
            };
            let Some(line_number) = data["line_number"].as_u64() else {
                continue;
            };
            hits.push(TextHit {
                filepath: path.trim_start_matches("./").replace('\\', "/"),
                line: line_number,
            });
            if hits.len() >= self.max_hits_per_resource {
                break;
            }
        }
        Ok(hits)
    }
}

struct Window {
    line_start: i64,
    line_end: i64,
    text: String,
}

/// Read the file behind a range and build its context window:
/// [`CONTEXT_LINES`] on each side, clamped to [`MAX_WINDOW_LINES`].
async fn context_window(root: &Path, range: &HitRange) -> Option<Window> {
    let bytes = tokio::fs::read(root.join(&range.filepath)).await.ok()?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len() as u64;

    let start = range.line_start.saturating_sub(1).saturating_sub(CONTEXT_LINES);
    let mut end = (range.line_end + CONTEXT_LINES).min(total);
    if end > start + MAX_WINDOW_LINES {
        end = start + MAX_WINDOW_LINES;
    }
    if start >= end {
        return None;
    }

    Some(Window {
        line_start: start as i64 + 1,
        line_end: end as i64,
        text: lines[start as usize..end as usize].join("\n"),
    })
}

/// Escape regex metacharacters in a keyword.
fn escape_regex(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}
