//! Core data models used throughout ctxpack.
//!
//! These types represent the resources, chunks, and jobs that flow through
//! the indexing and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! register → Resource → sync() → materialized tree → index() → Chunk
//!                                                        ↓
//!                                                   embed() → vector
//!                                                        ↓
//!                                                  search() → SearchResult
//! ```
//!
//! # Type Relationships
//!
//! - A **[`Resource`]** is the indexed unit: a remote git repository or a
//!   local directory, with separate content and vector lifecycles.
//! - A **[`Chunk`]** is a line-ranged slice of one file of a resource,
//!   optionally carrying a dense embedding vector.
//! - An **[`IndexJob`]** records one sync or index run with progress and
//!   warnings.
//! - A **[`ResearchJob`]** records one asynchronous deep-research run and
//!   its final outcome.
//! - A **[`SearchResult`]** is returned by the hybrid query engine.
//!
//! Timestamps on resources are Unix epoch seconds; job rows use epoch
//! milliseconds so queue ordering survives bursts of enqueues.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reciprocal-rank-fusion constant shared by both search channels.
pub const RRF_K: f64 = 60.0;

/// Kind of indexed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Git,
    Local,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "git" => Ok(Self::Git),
            "local" => Ok(Self::Local),
            other => Err(Error::Validation(format!("unknown resource kind: {other}"))),
        }
    }
}

/// Visibility scope of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Project,
    Global,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Self::Project),
            "global" => Ok(Self::Global),
            other => Err(Error::Validation(format!("unknown scope: {other}"))),
        }
    }
}

/// Lifecycle of a resource's materialized content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Missing,
    Syncing,
    Ready,
    Failed,
}

impl ContentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse_or_missing(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Missing,
        }
    }
}

/// Lifecycle of a resource's chunk/vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStatus {
    Missing,
    Indexing,
    Ready,
    Failed,
}

impl VectorStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Indexing => "indexing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse_or_missing(s: &str) -> Self {
        match s {
            "indexing" => Self::Indexing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Missing,
        }
    }
}

/// Legacy single-status view derived from the two lifecycle columns,
/// kept for callers that predate the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Indexing,
    Ready,
    Failed,
}

impl ResourceStatus {
    /// Map `(content, vector)` onto the legacy status.
    #[must_use]
    pub fn derived(content: ContentStatus, vector: VectorStatus) -> Self {
        if content == ContentStatus::Failed || vector == VectorStatus::Failed {
            return Self::Failed;
        }
        if content == ContentStatus::Syncing || vector == VectorStatus::Indexing {
            return Self::Indexing;
        }
        if content == ContentStatus::Ready && vector == VectorStatus::Ready {
            return Self::Ready;
        }
        Self::Pending
    }
}

/// The indexed unit: a git repository or local directory registered with
/// the engine.
///
/// Content and vector lifecycles are tracked separately: sync jobs drive
/// `content_status`, index jobs drive `vector_status`. Uniqueness is over
/// `(owner_id, scope, project_key, name)`.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    /// UUID v4 primary key.
    pub id: String,
    /// Owning user, when known.
    pub owner_id: Option<String>,
    /// Display name, unique within owner + scope + project key.
    pub name: String,
    pub scope: Scope,
    /// Empty string when scope is global.
    pub project_key: String,
    pub kind: ResourceKind,
    /// Remote URL; required iff kind is git.
    pub url: Option<String>,
    /// Local directory; required iff kind is local.
    pub path: Option<String>,
    pub branch: Option<String>,
    /// Pinned commit, when the resource tracks one.
    pub commit: Option<String>,
    /// Ordered scoped sub-paths; empty means the whole tree.
    pub paths: Vec<String>,
    pub notes: Option<String>,
    pub content_status: ContentStatus,
    pub vector_status: VectorStatus,
    pub content_error: Option<String>,
    pub vector_error: Option<String>,
    pub chunk_count: i64,
    pub last_synced_at: Option<i64>,
    pub last_indexed_at: Option<i64>,
    pub last_local_commit: Option<String>,
    pub last_remote_commit: Option<String>,
    pub update_available: bool,
    pub last_update_check_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Resource {
    /// Legacy single-status view.
    #[must_use]
    pub fn status(&self) -> ResourceStatus {
        ResourceStatus::derived(self.content_status, self.vector_status)
    }
}

/// Input for registering a resource.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewResource {
    pub owner_id: Option<String>,
    pub name: String,
    pub scope: Option<Scope>,
    #[serde(default)]
    pub project_key: String,
    pub kind: Option<ResourceKind>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    pub notes: Option<String>,
}

/// A line-ranged slice of one file, the unit of retrieval.
///
/// `contextualized_text` is the embedded form: the raw slice prefixed with
/// scope and entity hints. `hash` is
/// `sha256(filepath ':' line_start ':' line_end ':' contextualized_text)`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub resource_id: String,
    /// POSIX path relative to the resource root.
    pub filepath: String,
    /// 1-based inclusive range; `1 <= line_start <= line_end`.
    pub line_start: i64,
    pub line_end: i64,
    pub text: String,
    pub contextualized_text: String,
    /// Enclosing scope chain, e.g. `"MyModule > MyStruct"`.
    pub scope: String,
    /// Named entity hints, comma-separated.
    pub entities: String,
    pub language: String,
    pub hash: String,
    /// Dense vector; `None` when embedding failed for this chunk's batch.
    pub embedding: Option<Vec<f32>>,
}

/// Kind of background job on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Sync,
    Index,
}

impl JobKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(Self::Sync),
            "index" => Ok(Self::Index),
            other => Err(Error::Validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// Job lifecycle. Progresses queued → running → (completed | failed);
/// terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse_or_queued(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Pipeline stage a warning originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarnStage {
    Scan,
    Read,
    Chunk,
    Embed,
    Sync,
    RemoteCheck,
}

/// A non-fatal problem recorded on a job row, in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWarning {
    pub filepath: String,
    pub stage: WarnStage,
    pub message: String,
}

/// One sync or index run over a resource.
#[derive(Debug, Clone, Serialize)]
pub struct IndexJob {
    pub id: String,
    pub resource_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Advisory percentage, 0–100, monotonically non-decreasing while running.
    pub progress: i64,
    pub error: Option<String>,
    pub warnings: Vec<JobWarning>,
    pub total_files: i64,
    pub processed_files: i64,
    /// Epoch milliseconds.
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

/// Search mode selecting which subtracks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hybrid,
    Text,
    Vector,
}

impl SearchMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Text => "text",
            Self::Vector => "vector",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(Self::Hybrid),
            "text" => Ok(Self::Text),
            "vector" => Ok(Self::Vector),
            other => Err(Error::Validation(format!("unknown search mode: {other}"))),
        }
    }
}

/// Query inputs after clamping.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub mode: SearchMode,
    /// Weight for the vector channel, clamped to `[0, 1]`; NaN maps to 0.5.
    pub alpha: f64,
    /// Clamped to `[1, 50]`.
    pub top_k: usize,
    /// Restrict to these resource ids; empty means all visible resources.
    pub resource_ids: Vec<String>,
}

impl SearchOptions {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: SearchMode::Hybrid,
            alpha: 0.5,
            top_k: 10,
            resource_ids: Vec::new(),
        }
    }

    /// Clamp alpha and top_k into their valid ranges.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.alpha = clamp_alpha(self.alpha);
        self.top_k = self.top_k.clamp(1, 50);
        self
    }
}

/// Clamp an alpha weight to `[0, 1]`, mapping NaN to 0.5.
#[must_use]
pub fn clamp_alpha(alpha: f64) -> f64 {
    if alpha.is_nan() {
        0.5
    } else {
        alpha.clamp(0.0, 1.0)
    }
}

/// Which channel(s) produced a search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Hybrid,
    Text,
    Vector,
}

/// A search result returned from the hybrid query engine.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Persisted chunk id; `None` for text-channel windows built on the fly.
    pub chunk_id: Option<String>,
    pub resource_id: String,
    pub resource_name: String,
    pub filepath: String,
    pub line_start: i64,
    pub line_end: i64,
    pub text: String,
    pub score: f64,
    pub match_type: MatchType,
    /// Contributing channels, `["text", "vector"]` when both contributed.
    pub match_sources: Vec<String>,
}

impl SearchResult {
    /// Fusion and dedup key: chunk id when persisted, positional otherwise.
    #[must_use]
    pub fn fusion_key(&self) -> String {
        match &self.chunk_id {
            Some(id) => id.clone(),
            None => format!("{}:{}:{}", self.resource_id, self.filepath, self.line_start),
        }
    }
}

/// Research job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ResearchStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse_or_queued(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// Options echoed onto a research job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOptions {
    pub mode: SearchMode,
    pub alpha: f64,
    pub top_k: usize,
}

impl Default for ResearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            alpha: 0.5,
            top_k: 10,
        }
    }
}

/// An asynchronous deep-research run and its final outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchJob {
    pub id: String,
    pub owner_id: Option<String>,
    pub query: String,
    pub resource_ids: Vec<String>,
    pub options: ResearchOptions,
    pub status: ResearchStatus,
    /// Full agent outcome as JSON, present when completed.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_status_mapping() {
        use ContentStatus as C;
        use VectorStatus as V;
        assert_eq!(
            ResourceStatus::derived(C::Missing, V::Missing),
            ResourceStatus::Pending
        );
        assert_eq!(
            ResourceStatus::derived(C::Syncing, V::Missing),
            ResourceStatus::Indexing
        );
        assert_eq!(
            ResourceStatus::derived(C::Ready, V::Indexing),
            ResourceStatus::Indexing
        );
        assert_eq!(
            ResourceStatus::derived(C::Ready, V::Ready),
            ResourceStatus::Ready
        );
        assert_eq!(
            ResourceStatus::derived(C::Failed, V::Ready),
            ResourceStatus::Failed
        );
        assert_eq!(
            ResourceStatus::derived(C::Ready, V::Failed),
            ResourceStatus::Failed
        );
        // Content ready but never indexed: not ready yet.
        assert_eq!(
            ResourceStatus::derived(C::Ready, V::Missing),
            ResourceStatus::Pending
        );
    }

    #[test]
    fn clamp_alpha_bounds() {
        assert_eq!(clamp_alpha(-0.5), 0.0);
        assert_eq!(clamp_alpha(1.5), 1.0);
        assert_eq!(clamp_alpha(0.3), 0.3);
        assert_eq!(clamp_alpha(f64::NAN), 0.5);
    }

    #[test]
    fn options_clamping() {
        let opts = SearchOptions {
            top_k: 500,
            alpha: f64::NAN,
            ..SearchOptions::new("q")
        }
        .clamped();
        assert_eq!(opts.top_k, 50);
        assert_eq!(opts.alpha, 0.5);

        let opts = SearchOptions {
            top_k: 0,
            ..SearchOptions::new("q")
        }
        .clamped();
        assert_eq!(opts.top_k, 1);
    }

    #[test]
    fn fusion_key_prefers_chunk_id() {
        let mut result = SearchResult {
            chunk_id: Some("c-1".to_string()),
            resource_id: "r-1".to_string(),
            resource_name: "demo".to_string(),
            filepath: "src/lib.rs".to_string(),
            line_start: 10,
            line_end: 20,
            text: String::new(),
            score: 0.0,
            match_type: MatchType::Vector,
            match_sources: vec!["vector".to_string()],
        };
        assert_eq!(result.fusion_key(), "c-1");
        result.chunk_id = None;
        assert_eq!(result.fusion_key(), "r-1:src/lib.rs:10");
    }

    #[test]
    fn warn_stage_serializes_kebab_case() {
        let json = serde_json::to_string(&WarnStage::RemoteCheck).unwrap();
        assert_eq!(json, "\"remote-check\"");
        let json = serde_json::to_string(&WarnStage::Read).unwrap();
        assert_eq!(json, "\"read\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
