use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_home")]
    pub home: PathBuf,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub git: GitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            chunking: ChunkingConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            git: GitConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Upper bound on chunk text size in characters.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Files larger than this many bytes are skipped with a warning.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_max_chunk_size() -> usize {
    1500
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Weight for vector vs text: `hybrid = α*vector + (1-α)*text`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Per-subtrack deadline in seconds.
    #[serde(default = "default_subtrack_timeout_secs")]
    pub subtrack_timeout_secs: u64,
    /// Maximum grep hits collected per resource.
    #[serde(default = "default_max_hits_per_resource")]
    pub max_hits_per_resource: usize,
    /// Ripgrep-compatible binary used for the text subtrack.
    #[serde(default = "default_ripgrep_bin")]
    pub ripgrep_bin: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            top_k: default_top_k(),
            subtrack_timeout_secs: default_subtrack_timeout_secs(),
            max_hits_per_resource: default_max_hits_per_resource(),
            ripgrep_bin: default_ripgrep_bin(),
        }
    }
}

fn default_alpha() -> f64 {
    0.5
}
fn default_top_k() -> usize {
    10
}
fn default_subtrack_timeout_secs() -> u64 {
    10
}
fn default_max_hits_per_resource() -> usize {
    400
}
fn default_ripgrep_bin() -> String {
    "rg".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embed_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    /// Deadline for any single git subprocess, in seconds.
    #[serde(default = "default_git_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_git_timeout_secs(),
        }
    }
}

fn default_git_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn repos_dir(&self) -> PathBuf {
        self.home.join("repos")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.home.join("sandbox")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("ctxpack.sqlite")
    }

    /// Create the home directory layout if missing. Idempotent.
    pub fn ensure_home(&self) -> Result<()> {
        for dir in [
            self.repos_dir(),
            self.data_dir(),
            self.logs_dir(),
            self.sandbox_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn default_home() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ctxpack")
}

/// Get the user's home directory.
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Expand `~` at the start of a path to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") || s == "~" {
        if let Some(home) = home_dir() {
            return home.join(s.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let mut config: Config =
        toml::from_str(&content).map_err(|e| Error::Validation(format!("bad config: {e}")))?;
    config.home = expand_tilde(&config.home);

    if config.chunking.max_chunk_size == 0 {
        return Err(Error::Validation(
            "chunking.max_chunk_size must be > 0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.search.alpha) {
        return Err(Error::Validation(
            "search.alpha must be in [0.0, 1.0]".to_string(),
        ));
    }
    if config.search.top_k == 0 || config.search.top_k > 50 {
        return Err(Error::Validation(
            "search.top_k must be in [1, 50]".to_string(),
        ));
    }
    if config.embedding.dims == 0 {
        return Err(Error::Validation("embedding.dims must be > 0".to_string()));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.chunking.max_chunk_size, 1500);
        assert_eq!(config.chunking.max_file_bytes, 1024 * 1024);
        assert_eq!(config.search.top_k, 10);
        assert!((config.search.alpha - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.embedding.dims, 1536);
        assert_eq!(config.embedding.batch_size, 100);
    }

    #[test]
    fn home_subdirectories() {
        let config = Config {
            home: PathBuf::from("/tmp/ctxpack-test"),
            ..Config::default()
        };
        assert_eq!(config.repos_dir(), PathBuf::from("/tmp/ctxpack-test/repos"));
        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/ctxpack-test/data/ctxpack.sqlite")
        );
    }

    #[test]
    fn ensure_home_creates_layout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            home: tmp.path().join("home"),
            ..Config::default()
        };
        config.ensure_home().unwrap();
        for sub in ["repos", "data", "logs", "sandbox"] {
            assert!(tmp.path().join("home").join(sub).is_dir());
        }
        config.ensure_home().unwrap();
    }

    #[test]
    fn load_rejects_bad_alpha() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctxpack.toml");
        std::fs::write(&path, "[search]\nalpha = 1.5\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn load_accepts_minimal_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctxpack.toml");
        std::fs::write(&path, "home = \"/tmp/x\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.home, PathBuf::from("/tmp/x"));
    }
}
