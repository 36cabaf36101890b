//! Index job rows: queueing, claiming, and status transitions.
//!
//! Jobs of one resource are claimed oldest-first in `(created_at, rowid)`
//! order; `created_at` is stored in epoch milliseconds and rowid is
//! insertion-ordered, so enqueue bursts never reorder. Terminal rows are
//! immutable: transition statements match on the expected prior status and
//! affect zero rows otherwise.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{IndexJob, JobKind, JobStatus, JobWarning};

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue a job for a resource.
    pub async fn enqueue(&self, resource_id: &str, kind: JobKind) -> Result<IndexJob> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO index_jobs (id, resource_id, kind, status, created_at) \
             VALUES (?, ?, ?, 'queued', ?)",
        )
        .bind(&id)
        .bind(resource_id)
        .bind(kind.as_str())
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<IndexJob> {
        let row = sqlx::query("SELECT * FROM index_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// The oldest queued job of a resource, if any.
    pub async fn next_queued(&self, resource_id: &str) -> Result<Option<IndexJob>> {
        let row = sqlx::query(
            "SELECT * FROM index_jobs WHERE resource_id = ? AND status = 'queued' \
             ORDER BY created_at, rowid LIMIT 1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }

    /// Job history of a resource in queue order.
    pub async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<IndexJob>> {
        let rows = sqlx::query(
            "SELECT * FROM index_jobs WHERE resource_id = ? ORDER BY created_at, rowid",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// queued → running, resetting progress, counters, and error.
    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE index_jobs SET status = 'running', started_at = ?, progress = 0, \
             processed_files = 0, error = NULL WHERE id = ? AND status = 'queued'",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// running → completed with progress 100.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE index_jobs SET status = 'completed', progress = 100, completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// running → failed, recording the error.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE index_jobs SET status = 'failed', progress = 100, error = ?, \
             completed_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Raise progress; never lowers it.
    pub async fn set_progress(&self, id: &str, progress: i64) -> Result<()> {
        sqlx::query(
            "UPDATE index_jobs SET progress = MAX(progress, ?) \
             WHERE id = ? AND status = 'running'",
        )
        .bind(progress.clamp(0, 100))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_total_files(&self, id: &str, total: i64) -> Result<()> {
        sqlx::query("UPDATE index_jobs SET total_files = ? WHERE id = ?")
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_processed_files(&self, id: &str, processed: i64) -> Result<()> {
        sqlx::query("UPDATE index_jobs SET processed_files = ? WHERE id = ?")
            .bind(processed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a warning, preserving insertion order.
    pub async fn add_warning(&self, id: &str, warning: &JobWarning) -> Result<()> {
        let job = self.get(id).await?;
        let mut warnings = job.warnings;
        warnings.push(warning.clone());
        let json = serde_json::to_string(&warnings)?;
        sqlx::query("UPDATE index_jobs SET warnings = ? WHERE id = ?")
            .bind(json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IndexJob> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let warnings_json: String = row.get("warnings");
    Ok(IndexJob {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        kind: JobKind::parse(&kind)?,
        status: JobStatus::parse_or_queued(&status),
        progress: row.get("progress"),
        error: row.get("error"),
        warnings: serde_json::from_str(&warnings_json).unwrap_or_default(),
        total_files: row.get("total_files"),
        processed_files: row.get("processed_files"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
