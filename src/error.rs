//! Error types for the ctxpack engine.

/// Errors surfaced by the engine.
///
/// The `Db`, `Io`, `Json`, and `Http` variants are the transient family:
/// retriable infrastructure failures wrapped from their source crates.
/// Everything else is a domain condition that callers are expected to
/// branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A resource, job, or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input: missing URL for git, missing path for local,
    /// missing project key for project scope, and similar.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A resource with the same (owner, scope, project key, name) already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Embedder or chat model failure.
    #[error("upstream provider error: {0}")]
    Upstream(String),

    /// A subprocess exited non-zero.
    #[error("command `{command}` failed: {stderr}")]
    Tool { command: String, stderr: String },

    /// A bounded operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(String),

    /// Database error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// IO error reading or writing the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error talking to a provider.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether retrying the operation could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Db(_) | Self::Io(_) | Self::Http(_) | Self::Timeout(_)
        )
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
