//! Indexing pipeline orchestration.
//!
//! Drives the two job kinds end to end:
//!
//! 1. **Sync** — materialize content (clone/fetch for git, validate for
//!    local), resolve the file list, record commits and the
//!    update-available flag. Transitions content-status syncing → ready.
//! 2. **Index** — read files, chunk, embed in batches, and atomically
//!    replace the resource's chunk set. Transitions vector-status
//!    indexing → ready.
//!
//! Per-file problems (oversized, binary, unreadable, unparseable) become
//! warnings on the job row and never abort the run. Embedding failures
//! degrade to chunks without vectors. A job only fails on unrecoverable
//! conditions: missing materialized path, every file unreadable, or a
//! schema write failure.
//!
//! # Progress model
//!
//! `0` on start; `10` after discovery (`95` when no files); `40` after
//! chunking; `40 + ⌊(batch+1)/batches × 55⌋` capped at `95` while
//! embedding; `100` on completion. Advisory only.

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk_store::{ChunkStore, NewChunk};
use crate::chunker::{chunk_files, DraftChunk, FileInput};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::jobs::JobStore;
use crate::models::{
    ContentStatus, JobWarning, Resource, ResourceKind, VectorStatus, WarnStage,
};
use crate::providers::Capabilities;
use crate::repo::Materializer;
use crate::resources::ResourceStore;

pub struct Indexer {
    resources: ResourceStore,
    chunks: ChunkStore,
    jobs: JobStore,
    materializer: Arc<Materializer>,
    config: Arc<Config>,
}

impl Indexer {
    #[must_use]
    pub fn new(pool: &SqlitePool, config: Arc<Config>, materializer: Arc<Materializer>) -> Self {
        Self {
            resources: ResourceStore::new(pool.clone()),
            chunks: ChunkStore::new(pool.clone()),
            jobs: JobStore::new(pool.clone()),
            materializer,
            config,
        }
    }

    /// Run a sync job. On failure the resource's content-status is set to
    /// failed with the message, and the error propagates to the caller.
    pub async fn run_sync(&self, resource_id: &str, job_id: &str) -> Result<()> {
        let resource = self.resources.get(resource_id).await?;
        self.resources
            .set_content_status(resource_id, ContentStatus::Syncing, None)
            .await?;

        let outcome = self.sync_inner(&resource, job_id).await;
        if let Err(e) = &outcome {
            let message = e.to_string();
            tracing::warn!(resource = resource_id, error = %message, "sync failed");
            self.resources
                .set_content_status(resource_id, ContentStatus::Failed, Some(&message))
                .await?;
        }
        outcome
    }

    async fn sync_inner(&self, resource: &Resource, job_id: &str) -> Result<()> {
        match resource.kind {
            ResourceKind::Git => {
                let dir = self.materializer.prepare(resource).await?;
                let tracked = self.materializer.list_tracked(&dir).await?;
                let files = intersect_scoped(&tracked, &resource.paths);
                self.jobs.set_total_files(job_id, files.len() as i64).await?;

                let local = self.materializer.rev_parse(&dir).await;
                let remote = match (&resource.url, &resource.branch) {
                    (Some(url), Some(branch)) => {
                        use crate::repo::GitProbe;
                        self.materializer.remote_head(url, branch).await
                    }
                    _ => None,
                };
                let update_available = match (&local, &remote) {
                    (Some(l), Some(r)) => Some(l != r),
                    _ => None,
                };

                self.resources
                    .record_sync(
                        &resource.id,
                        local.as_deref(),
                        remote.as_deref(),
                        update_available,
                    )
                    .await?;
            }
            ResourceKind::Local => {
                let path = resource
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::Validation("local resource has no path".to_string()))?;
                let root = Materializer::validate_local(path)?;
                let files = Materializer::walk_local(&root)?;
                let files = intersect_scoped(&files, &resource.paths);
                self.jobs.set_total_files(job_id, files.len() as i64).await?;

                let local = self.materializer.rev_parse(&root).await;
                self.resources
                    .record_sync(&resource.id, local.as_deref(), None, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Run an index job. On failure the resource's vector-status is set to
    /// failed with the message, and the error propagates to the caller.
    pub async fn run_index(
        &self,
        resource_id: &str,
        job_id: &str,
        caps: &Capabilities,
    ) -> Result<()> {
        let resource = self.resources.get(resource_id).await?;
        self.resources
            .set_vector_status(resource_id, VectorStatus::Indexing, None)
            .await?;

        match self.index_inner(&resource, job_id, caps).await {
            Ok(inserted) => {
                self.resources.record_index(resource_id, inserted).await?;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(resource = resource_id, error = %message, "index failed");
                self.resources
                    .set_vector_status(resource_id, VectorStatus::Failed, Some(&message))
                    .await?;
                Err(e)
            }
        }
    }

    async fn index_inner(
        &self,
        resource: &Resource,
        job_id: &str,
        caps: &Capabilities,
    ) -> Result<i64> {
        let (root, files) = self.resolve_files(resource).await?;
        self.jobs.set_total_files(job_id, files.len() as i64).await?;

        if files.is_empty() {
            self.jobs.set_progress(job_id, 95).await?;
            // Still a delete-then-insert: a re-index of an emptied tree
            // must not leave stale chunks behind.
            self.chunks.replace_with(&resource.id, &[]).await?;
            return Ok(0);
        }
        self.jobs.set_progress(job_id, 10).await?;

        let (inputs, read_errors) = self.read_files(&root, &files, job_id).await?;
        if read_errors == files.len() {
            return Err(Error::Validation(
                "every file in the resource failed to read".to_string(),
            ));
        }

        let mut drafts: Vec<DraftChunk> = Vec::new();
        for outcome in chunk_files(&inputs, self.config.chunking.max_chunk_size) {
            match outcome.result {
                Ok(mut file_chunks) => drafts.append(&mut file_chunks),
                Err(message) => {
                    self.warn(job_id, &outcome.filepath, WarnStage::Chunk, &message)
                        .await?;
                }
            }
        }
        self.jobs.set_progress(job_id, 40).await?;

        if drafts.is_empty() {
            self.chunks.replace_with(&resource.id, &[]).await?;
            return Ok(0);
        }

        let batch_size = self.config.embedding.batch_size.max(1);
        let total_batches = drafts.len().div_ceil(batch_size);
        let mut inserted = 0i64;

        for (batch_index, batch) in drafts.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch
                .iter()
                .map(|d| d.contextualized_text.clone())
                .collect();

            let slots = match caps.embedder.embed_many(&texts).await {
                Ok(slots) => slots,
                Err(e) => {
                    self.warn(
                        job_id,
                        "",
                        WarnStage::Embed,
                        &format!("embedding batch {batch_index} failed: {e}"),
                    )
                    .await?;
                    vec![None; batch.len()]
                }
            };

            let rows: Vec<NewChunk> = batch
                .iter()
                .zip(slots.into_iter().chain(std::iter::repeat(None)))
                .map(|(draft, embedding)| NewChunk {
                    draft: draft.clone(),
                    embedding,
                })
                .collect();

            // First successful batch clears the previous chunk set within
            // the same write; later batches extend the new set.
            if batch_index == 0 {
                self.chunks.replace_with(&resource.id, &rows).await?;
            } else {
                self.chunks.append(&resource.id, &rows).await?;
            }
            inserted += rows.len() as i64;

            let progress = 40 + ((batch_index as i64 + 1) * 55 / total_batches as i64);
            self.jobs.set_progress(job_id, progress.min(95)).await?;
        }

        Ok(inserted)
    }

    async fn resolve_files(&self, resource: &Resource) -> Result<(PathBuf, Vec<String>)> {
        match resource.kind {
            ResourceKind::Git => {
                let dir = self.materializer.dir_for(&resource.id);
                if !dir.join(".git").is_dir() {
                    return Err(Error::NotFound(format!(
                        "materialized path for resource {}; run sync first",
                        resource.id
                    )));
                }
                let tracked = self.materializer.list_tracked(&dir).await?;
                Ok((dir, intersect_scoped(&tracked, &resource.paths)))
            }
            ResourceKind::Local => {
                let path = resource
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::Validation("local resource has no path".to_string()))?;
                let root = Materializer::validate_local(path)?;
                let files = Materializer::walk_local(&root)?;
                Ok((root, intersect_scoped(&files, &resource.paths)))
            }
        }
    }

    /// Read candidate files, converting skips and failures into warnings.
    /// Returns the readable inputs and the count of hard read errors.
    async fn read_files(
        &self,
        root: &Path,
        files: &[String],
        job_id: &str,
    ) -> Result<(Vec<FileInput>, usize)> {
        let max_bytes = self.config.chunking.max_file_bytes;
        let mut inputs = Vec::with_capacity(files.len());
        let mut read_errors = 0usize;

        for (i, filepath) in files.iter().enumerate() {
            let abs = root.join(filepath);

            match tokio::fs::metadata(&abs).await {
                Ok(meta) if meta.len() > max_bytes => {
                    self.warn(
                        job_id,
                        filepath,
                        WarnStage::Read,
                        &format!("file exceeds {max_bytes} bytes, skipped"),
                    )
                    .await?;
                }
                Ok(_) => match tokio::fs::read(&abs).await {
                    Ok(bytes) if bytes.contains(&0) => {
                        self.warn(job_id, filepath, WarnStage::Read, "binary file, skipped")
                            .await?;
                    }
                    Ok(bytes) => {
                        inputs.push(FileInput {
                            filepath: filepath.clone(),
                            code: String::from_utf8_lossy(&bytes).into_owned(),
                        });
                    }
                    Err(e) => {
                        read_errors += 1;
                        self.warn(job_id, filepath, WarnStage::Read, &e.to_string())
                            .await?;
                    }
                },
                Err(e) => {
                    read_errors += 1;
                    self.warn(job_id, filepath, WarnStage::Scan, &e.to_string())
                        .await?;
                }
            }

            self.jobs
                .set_processed_files(job_id, (i + 1) as i64)
                .await?;
        }

        Ok((inputs, read_errors))
    }

    async fn warn(
        &self,
        job_id: &str,
        filepath: &str,
        stage: WarnStage,
        message: &str,
    ) -> Result<()> {
        self.jobs
            .add_warning(
                job_id,
                &JobWarning {
                    filepath: filepath.to_string(),
                    stage,
                    message: message.to_string(),
                },
            )
            .await
    }
}

/// Intersect a file list with the resource's scoped sub-paths. An empty
/// scope keeps everything. A scoped entry matches itself or any file
/// beneath it.
#[must_use]
pub fn intersect_scoped(files: &[String], paths: &[String]) -> Vec<String> {
    if paths.is_empty() {
        return files.to_vec();
    }
    files
        .iter()
        .filter(|file| {
            paths.iter().any(|scoped| {
                let prefix = scoped.trim_end_matches('/');
                file.as_str() == prefix || file.starts_with(&format!("{prefix}/"))
            })
        })
        .cloned()
        .collect()
}
