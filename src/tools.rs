//! Resource-scoped tool operations and the agent tool registry.
//!
//! The same five tools serve the agent driver and external callers:
//! `search`, `grep`, `read`, `list`, and `glob`. Outputs are capped —
//! grep at 100 matches, list and glob at 500 entries, read at 500 lines,
//! search previews at 12 lines / 600 characters. When exactly one
//! resource is in scope, the resource id parameter may be omitted.

use async_trait::async_trait;
use globset::Glob;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Resource, ResourceKind, SearchMode, SearchOptions};
use crate::providers::Capabilities;
use crate::repo::Materializer;
use crate::search::SearchEngine;

pub const READ_MAX_LINES: usize = 500;
pub const GREP_MAX_MATCHES: usize = 100;
pub const LIST_MAX_FILES: usize = 500;
pub const PREVIEW_MAX_LINES: usize = 12;
pub const PREVIEW_MAX_CHARS: usize = 600;

/// Join a user-supplied relative path onto a resource root, rejecting
/// absolute paths and parent traversal.
pub fn safe_join(root: &Path, filepath: &str) -> Result<PathBuf> {
    let relative = Path::new(filepath);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Validation(format!("invalid path: {filepath}")));
    }
    Ok(root.join(relative))
}

/// Read a file, optionally restricted to a 1-based inclusive line range,
/// capped at [`READ_MAX_LINES`] lines.
pub async fn read_file(
    root: &Path,
    filepath: &str,
    start_line: Option<usize>,
    end_line: Option<usize>,
) -> Result<(String, usize, usize)> {
    let abs = safe_join(root, filepath)?;
    let content = tokio::fs::read_to_string(&abs)
        .await
        .map_err(|_| Error::NotFound(format!("file {filepath}")))?;
    let lines: Vec<&str> = content.lines().collect();

    let start = start_line.unwrap_or(1).max(1);
    let end = end_line.unwrap_or(lines.len()).min(lines.len());
    if start > lines.len() || start > end {
        return Ok((String::new(), start, start.saturating_sub(1)));
    }
    let end = end.min(start + READ_MAX_LINES - 1);

    Ok((lines[start - 1..end].join("\n"), start, end))
}

/// One grep match.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GrepMatch {
    pub filepath: String,
    pub line: u64,
    pub text: String,
}

/// Grep a resource tree with a raw pattern, capped at
/// [`GREP_MAX_MATCHES`] matches.
pub async fn grep_matches(
    rg_bin: &str,
    root: &Path,
    pattern: &str,
    timeout: Duration,
) -> Result<Vec<GrepMatch>> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(rg_bin)
            .arg("--json")
            .arg("--smart-case")
            .arg("-e")
            .arg(pattern)
            .arg(".")
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| Error::Timeout(format!("{rg_bin} grep")))??;

    if !output.status.success() && output.status.code() != Some(1) {
        return Err(Error::Tool {
            command: format!("{rg_bin} --json -e {pattern}"),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut matches = Vec::new();
    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if event.get("type").and_then(|t| t.as_str()) != Some("match") {
            continue;
        }
        let data = &event["data"];
        let (Some(path), Some(line_number)) = (
            data["path"]["text"].as_str(),
            data["line_number"].as_u64(),
        ) else {
            continue;
        };
        matches.push(GrepMatch {
            filepath: path.trim_start_matches("./").replace('\\', "/"),
            line: line_number,
            text: data["lines"]["text"]
                .as_str()
                .unwrap_or("")
                .trim_end()
                .to_string(),
        });
        if matches.len() >= GREP_MAX_MATCHES {
            break;
        }
    }
    Ok(matches)
}

/// List a resource's files: tracked listing for git checkouts, a walk
/// otherwise. Capped at [`LIST_MAX_FILES`].
pub async fn list_files(materializer: &Materializer, resource: &Resource) -> Result<Vec<String>> {
    let root = materializer.content_root(resource)?;
    let mut files = match resource.kind {
        ResourceKind::Git if root.join(".git").is_dir() => {
            materializer.list_tracked(&root).await?
        }
        _ => Materializer::walk_local(&root)?,
    };
    files.truncate(LIST_MAX_FILES);
    Ok(files)
}

/// Match a glob pattern against a resource tree, skipping `node_modules/`
/// and `.git/`. Capped at [`LIST_MAX_FILES`].
pub fn glob_files(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let matcher = Glob::new(pattern)
        .map_err(|e| Error::Validation(format!("bad glob pattern: {e}")))?
        .compile_matcher();

    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        !(entry.file_type().is_dir() && (name == "node_modules" || name == ".git"))
    });
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if matcher.is_match(&relative) {
            files.push(relative);
            if files.len() >= LIST_MAX_FILES {
                break;
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Truncate a search preview to [`PREVIEW_MAX_LINES`] lines and
/// [`PREVIEW_MAX_CHARS`] characters.
#[must_use]
pub fn truncate_preview(text: &str) -> String {
    let mut preview: String = text
        .lines()
        .take(PREVIEW_MAX_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    if preview.chars().count() > PREVIEW_MAX_CHARS {
        preview = preview.chars().take(PREVIEW_MAX_CHARS).collect();
    }
    preview
}

// ═══════════════════════════════════════════════════════════════════════
// Agent tool registry
// ═══════════════════════════════════════════════════════════════════════

/// Context bridge for tool execution: the scoped resources plus the
/// engine handles a tool needs.
pub struct ToolContext {
    pub search: Arc<SearchEngine>,
    pub materializer: Arc<Materializer>,
    pub config: Arc<Config>,
    pub caps: Capabilities,
    pub owner: Option<String>,
    /// Resources in scope for this run.
    pub resources: Vec<Resource>,
}

impl ToolContext {
    /// Resolve the target resource from a tool parameter. The id may be
    /// omitted only when exactly one resource is in scope.
    pub fn resolve_resource(&self, params: &serde_json::Value) -> Result<&Resource> {
        match params.get("resource_id").and_then(|v| v.as_str()) {
            Some(id) => self
                .resources
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::NotFound(format!("resource {id} not in scope"))),
            None if self.resources.len() == 1 => Ok(&self.resources[0]),
            None => Err(Error::Validation(
                "resource_id is required when more than one resource is in scope".to_string(),
            )),
        }
    }

    fn grep_timeout(&self) -> Duration {
        Duration::from_secs(self.config.search.subtrack_timeout_secs)
    }
}

/// A tool the agent can discover and call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool input.
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext)
        -> Result<serde_json::Value>;
}

/// Registry of tools exposed to one agent run.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry pre-loaded with the built-in tools.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(GrepTool));
        registry.register(Box::new(ReadTool));
        registry.register(Box::new(ListTool));
        registry.register(Box::new(GlobTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    /// Specs for the chat model.
    #[must_use]
    pub fn specs(&self) -> Vec<crate::chat::ToolSpec> {
        self.tools
            .iter()
            .map(|t| crate::chat::ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn resource_id_property() -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": "Target resource id; may be omitted when exactly one resource is in scope"
    })
}

/// Hybrid search over the scoped resources, returning truncated previews.
pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search indexed resources with combined keyword and semantic retrieval"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "mode": { "type": "string", "enum": ["hybrid", "text", "vector"], "default": "hybrid" },
                "top_k": { "type": "integer", "default": 10 },
                "resource_id": resource_id_property(),
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or("")
            .to_string();
        if query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }

        let mode = match params.get("mode").and_then(|m| m.as_str()) {
            Some(mode) => SearchMode::parse(mode)?,
            None => SearchMode::Hybrid,
        };
        let top_k = params
            .get("top_k")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(10) as usize;

        let resource_ids = match params.get("resource_id").and_then(|v| v.as_str()) {
            Some(id) => vec![id.to_string()],
            None => ctx.resources.iter().map(|r| r.id.clone()).collect(),
        };

        let opts = SearchOptions {
            mode,
            top_k,
            resource_ids,
            ..SearchOptions::new(query)
        };
        let results = ctx
            .search
            .search(ctx.owner.as_deref(), opts, &ctx.caps)
            .await?;

        let previews: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "chunk_id": r.chunk_id,
                    "resource_id": r.resource_id,
                    "resource_name": r.resource_name,
                    "filepath": r.filepath,
                    "line_start": r.line_start,
                    "line_end": r.line_end,
                    "score": r.score,
                    "match_type": r.match_type,
                    "preview": truncate_preview(&r.text),
                })
            })
            .collect();
        Ok(serde_json::json!({ "results": previews }))
    }
}

/// Pattern search over one resource's tree.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents in a resource with a regex pattern"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regex pattern" },
                "resource_id": resource_id_property(),
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let pattern = params
            .get("pattern")
            .and_then(|p| p.as_str())
            .ok_or_else(|| Error::Validation("pattern is required".to_string()))?;
        let resource = ctx.resolve_resource(&params)?;
        let root = ctx.materializer.content_root(resource)?;

        let matches = grep_matches(
            &ctx.config.search.ripgrep_bin,
            &root,
            pattern,
            ctx.grep_timeout(),
        )
        .await?;
        Ok(serde_json::json!({ "matches": matches }))
    }
}

/// Read a file, optionally a line range.
pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file from a resource, optionally a line range"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filepath": { "type": "string" },
                "start_line": { "type": "integer" },
                "end_line": { "type": "integer" },
                "resource_id": resource_id_property(),
            },
            "required": ["filepath"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let filepath = params
            .get("filepath")
            .and_then(|p| p.as_str())
            .ok_or_else(|| Error::Validation("filepath is required".to_string()))?;
        let resource = ctx.resolve_resource(&params)?;
        let root = ctx.materializer.content_root(resource)?;

        let start = params
            .get("start_line")
            .and_then(serde_json::Value::as_u64)
            .map(|v| v as usize);
        let end = params
            .get("end_line")
            .and_then(serde_json::Value::as_u64)
            .map(|v| v as usize);

        let (text, line_start, line_end) = read_file(&root, filepath, start, end).await?;
        Ok(serde_json::json!({
            "filepath": filepath,
            "line_start": line_start,
            "line_end": line_end,
            "text": text,
        }))
    }
}

/// List a resource's files.
pub struct ListTool;

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List the files of a resource"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "resource_id": resource_id_property(),
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let resource = ctx.resolve_resource(&params)?;
        let files = list_files(&ctx.materializer, resource).await?;
        Ok(serde_json::json!({ "files": files }))
    }
}

/// Glob over a resource's tree.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files in a resource matching a glob pattern"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Glob pattern, e.g. **/*.rs" },
                "resource_id": resource_id_property(),
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let pattern = params
            .get("pattern")
            .and_then(|p| p.as_str())
            .ok_or_else(|| Error::Validation("pattern is required".to_string()))?;
        let resource = ctx.resolve_resource(&params)?;
        let root = ctx.materializer.content_root(resource)?;
        let files = glob_files(&root, pattern)?;
        Ok(serde_json::json!({ "files": files }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_traversal() {
        let root = Path::new("/srv/repo");
        assert!(safe_join(root, "src/lib.rs").is_ok());
        assert!(safe_join(root, "../etc/passwd").is_err());
        assert!(safe_join(root, "a/../../b").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn read_file_caps_and_ranges() {
        let tmp = tempfile::TempDir::new().unwrap();
        let content = (1..=600)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(tmp.path().join("big.txt"), &content).unwrap();

        let (text, start, end) = read_file(tmp.path(), "big.txt", None, None).await.unwrap();
        assert_eq!(start, 1);
        assert_eq!(end, READ_MAX_LINES);
        assert_eq!(text.lines().count(), READ_MAX_LINES);

        let (text, start, end) = read_file(tmp.path(), "big.txt", Some(10), Some(12))
            .await
            .unwrap();
        assert_eq!((start, end), (10, 12));
        assert_eq!(text, "line 10\nline 11\nline 12");

        // Range past the end of the file comes back empty.
        let (text, _, _) = read_file(tmp.path(), "big.txt", Some(1000), None)
            .await
            .unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn glob_matches_and_skips_vendored_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/lib.rs"), "x").unwrap();
        std::fs::write(tmp.path().join("readme.md"), "x").unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        std::fs::write(tmp.path().join("node_modules/pkg/index.rs"), "x").unwrap();

        let files = glob_files(tmp.path(), "**/*.rs").unwrap();
        assert_eq!(files, vec!["src/lib.rs".to_string()]);

        assert!(glob_files(tmp.path(), "[bad").is_err());
    }

    #[test]
    fn preview_truncation() {
        let text = (0..40).map(|i| format!("l{i}")).collect::<Vec<_>>().join("\n");
        let preview = truncate_preview(&text);
        assert_eq!(preview.lines().count(), PREVIEW_MAX_LINES);

        let long_line = "x".repeat(2000);
        assert_eq!(truncate_preview(&long_line).chars().count(), PREVIEW_MAX_CHARS);
    }
}
