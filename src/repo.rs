//! Repository materializer: brings resource content onto the filesystem.
//!
//! Git resources are shallow-cloned into `<home>/repos/<resource-id>` and
//! kept fresh with depth-1 fetches; local resources are validated and
//! walked in place. Every git subprocess runs with an explicit working
//! directory, no inherited stdin, captured output, and a bounded timeout.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Resource, ResourceKind};

/// Directory names skipped at any depth when walking local trees.
pub const EXCLUDED_DIRS: [&str; 6] = [
    ".git",
    "node_modules",
    "dist",
    "build",
    ".next",
    "coverage",
];

/// Read-only git lookups, split out so the update checker can be tested
/// against a stub.
#[async_trait]
pub trait GitProbe: Send + Sync {
    /// HEAD SHA of a working tree, or `None` on any failure.
    async fn head_commit(&self, dir: &Path) -> Option<String>;
    /// SHA of `refs/heads/<branch>` on the remote, or `None` on any failure.
    async fn remote_head(&self, url: &str, branch: &str) -> Option<String>;
}

/// Maps resources to on-disk directories and keeps them current.
pub struct Materializer {
    root: PathBuf,
    timeout: Duration,
}

impl Materializer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.repos_dir(),
            timeout: Duration::from_secs(config.git.timeout_secs),
        }
    }

    /// Directory a git resource materializes into.
    #[must_use]
    pub fn dir_for(&self, resource_id: &str) -> PathBuf {
        self.root.join(resource_id)
    }

    /// Root directory holding a resource's files, by kind.
    pub fn content_root(&self, resource: &Resource) -> Result<PathBuf> {
        match resource.kind {
            ResourceKind::Git => Ok(self.dir_for(&resource.id)),
            ResourceKind::Local => {
                let path = resource.path.as_deref().ok_or_else(|| {
                    Error::Validation("local resource has no path".to_string())
                })?;
                Ok(PathBuf::from(path))
            }
        }
    }

    /// Idempotently clone or update a git resource. Returns the absolute
    /// directory holding the checkout.
    pub async fn prepare(&self, resource: &Resource) -> Result<PathBuf> {
        let url = resource
            .url
            .as_deref()
            .ok_or_else(|| Error::Validation("git resource has no url".to_string()))?;
        let dir = self.dir_for(&resource.id);

        if dir.join(".git").is_dir() {
            self.update(&dir, url, resource).await?;
        } else {
            // A directory without git metadata is a broken half-clone.
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
            self.clone_into(&dir, url, resource.branch.as_deref()).await?;
        }

        Ok(dir)
    }

    async fn clone_into(&self, dir: &Path, url: &str, branch: Option<&str>) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let dir_str = dir.to_string_lossy().to_string();

        if let Some(branch) = branch {
            let attempt = self
                .run_git(
                    None,
                    &[
                        "clone",
                        "--depth",
                        "1",
                        "--single-branch",
                        "--branch",
                        branch,
                        url,
                        &dir_str,
                    ],
                )
                .await;
            if attempt.is_ok() {
                return Ok(());
            }
            tracing::warn!(url, branch, "branch clone failed, retrying without branch");
        }

        self.run_git(None, &["clone", "--depth", "1", url, &dir_str])
            .await?;
        Ok(())
    }

    async fn update(&self, dir: &Path, url: &str, resource: &Resource) -> Result<()> {
        self.run_git(Some(dir), &["remote", "set-url", "origin", url])
            .await?;

        let target = resource
            .commit
            .as_deref()
            .or(resource.branch.as_deref())
            .unwrap_or("HEAD");
        self.run_git(Some(dir), &["fetch", "--depth", "1", "origin", target])
            .await?;

        let checkout_ref = resource.commit.as_deref().unwrap_or("FETCH_HEAD");
        self.run_git(Some(dir), &["checkout", "--force", checkout_ref])
            .await?;
        Ok(())
    }

    /// Tracked files of a checkout, as POSIX paths.
    pub async fn list_tracked(&self, dir: &Path) -> Result<Vec<String>> {
        let output = self.run_git(Some(dir), &["ls-files", "-z"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(|p| p.replace('\\', "/"))
            .collect())
    }

    /// Validate a local resource root exists and is a directory.
    pub fn validate_local(path: &str) -> Result<PathBuf> {
        let root = PathBuf::from(path);
        if !root.is_dir() {
            return Err(Error::NotFound(format!("local path {path}")));
        }
        Ok(root)
    }

    /// Walk a local tree, skipping [`EXCLUDED_DIRS`] at any depth.
    /// Returns POSIX paths relative to `root`, sorted.
    pub fn walk_local(root: &Path) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()))
        });

        for entry in walker {
            let entry = entry.map_err(|e| {
                Error::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walk failed")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }

        files.sort();
        Ok(files)
    }

    /// Local commit of an arbitrary directory (`rev-parse HEAD`), nullable.
    pub async fn rev_parse(&self, dir: &Path) -> Option<String> {
        let output = self.run_git(Some(dir), &["rev-parse", "HEAD"]).await.ok()?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            None
        } else {
            Some(sha)
        }
    }

    async fn run_git(&self, dir: Option<&Path>, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let command_line = format!("git {}", args.join(" "));
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(command_line.clone()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Tool {
                command: command_line,
                stderr,
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl GitProbe for Materializer {
    async fn head_commit(&self, dir: &Path) -> Option<String> {
        self.rev_parse(dir).await
    }

    async fn remote_head(&self, url: &str, branch: &str) -> Option<String> {
        let output = self
            .run_git(None, &["ls-remote", "--heads", url, branch])
            .await
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Each line is "<sha>\trefs/heads/<branch>".
        stdout
            .lines()
            .find(|line| line.ends_with(&format!("refs/heads/{branch}")))
            .and_then(|line| line.split_whitespace().next())
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_materializer(root: &Path) -> Materializer {
        Materializer {
            root: root.to_path_buf(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn walk_skips_excluded_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/lib.rs"), "fn x() {}").unwrap();
        for dir in ["node_modules", ".git", "dist", "deep/coverage"] {
            std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
            std::fs::write(tmp.path().join(dir).join("skip.txt"), "no").unwrap();
        }

        let files = Materializer::walk_local(tmp.path()).unwrap();
        assert_eq!(files, vec!["a.txt".to_string(), "src/lib.rs".to_string()]);
    }

    #[test]
    fn validate_local_rejects_missing() {
        let err = Materializer::validate_local("/definitely/not/here").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn rev_parse_outside_repo_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        let m = test_materializer(tmp.path());
        assert!(m.rev_parse(tmp.path()).await.is_none());
    }

    #[tokio::test]
    async fn run_git_surfaces_command_on_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let m = test_materializer(tmp.path());
        let err = m
            .run_git(Some(tmp.path()), &["rev-parse", "HEAD"])
            .await
            .unwrap_err();
        match err {
            Error::Tool { command, .. } => assert_eq!(command, "git rev-parse HEAD"),
            other => panic!("expected Tool error, got {other}"),
        }
    }

    #[tokio::test]
    async fn prepare_and_list_tracked_on_real_repo() {
        // Build a source repo, then materialize it via a file:// clone.
        let src = tempfile::TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(src.path())
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        std::fs::write(src.path().join("readme.md"), "hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);

        let repos = tempfile::TempDir::new().unwrap();
        let m = test_materializer(repos.path());
        let resource = Resource {
            id: "res-1".to_string(),
            owner_id: None,
            name: "demo".to_string(),
            scope: crate::models::Scope::Global,
            project_key: String::new(),
            kind: ResourceKind::Git,
            url: Some(format!("file://{}", src.path().display())),
            path: None,
            branch: Some("main".to_string()),
            commit: None,
            paths: Vec::new(),
            notes: None,
            content_status: crate::models::ContentStatus::Missing,
            vector_status: crate::models::VectorStatus::Missing,
            content_error: None,
            vector_error: None,
            chunk_count: 0,
            last_synced_at: None,
            last_indexed_at: None,
            last_local_commit: None,
            last_remote_commit: None,
            update_available: false,
            last_update_check_at: None,
            created_at: 0,
            updated_at: 0,
        };

        let dir = m.prepare(&resource).await.unwrap();
        assert!(dir.join(".git").is_dir());

        let tracked = m.list_tracked(&dir).await.unwrap();
        assert_eq!(tracked, vec!["readme.md".to_string()]);

        let head = m.head_commit(&dir).await;
        assert!(head.is_some());

        // Second prepare takes the fetch path and stays idempotent.
        let dir2 = m.prepare(&resource).await.unwrap();
        assert_eq!(dir, dir2);

        let remote = m
            .remote_head(resource.url.as_deref().unwrap(), "main")
            .await;
        assert_eq!(remote, head);
    }
}
