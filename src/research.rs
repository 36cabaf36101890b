//! Asynchronous research jobs.
//!
//! A research job persists a deep-research request, runs the agent driver
//! in the background, and writes the final outcome (or the failure) back
//! to the row. Failed jobs are never retried by the engine.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::agent::AgentDriver;
use crate::error::{Error, Result};
use crate::jobs::now_millis;
use crate::models::{ResearchJob, ResearchOptions, ResearchStatus};
use crate::providers::Capabilities;

#[derive(Clone)]
pub struct ResearchStore {
    pool: SqlitePool,
}

impl ResearchStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a queued research job.
    pub async fn create(
        &self,
        owner_id: Option<&str>,
        query: &str,
        resource_ids: &[String],
        options: &ResearchOptions,
    ) -> Result<ResearchJob> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO research_jobs (id, owner_id, query, resource_ids, options, status, created_at) \
             VALUES (?, ?, ?, ?, ?, 'queued', ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(query)
        .bind(serde_json::to_string(resource_ids)?)
        .bind(serde_json::to_string(options)?)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<ResearchJob> {
        let row = sqlx::query("SELECT * FROM research_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| research_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("research job {id}")))
    }

    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE research_jobs SET status = 'running', started_at = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete(&self, id: &str, result: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE research_jobs SET status = 'completed', result = ?, completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(result.to_string())
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE research_jobs SET status = 'failed', error = ?, completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn research_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ResearchJob> {
    let status: String = row.get("status");
    let resource_ids: String = row.get("resource_ids");
    let options: String = row.get("options");
    let result: Option<String> = row.get("result");
    Ok(ResearchJob {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        query: row.get("query"),
        resource_ids: serde_json::from_str(&resource_ids).unwrap_or_default(),
        options: serde_json::from_str(&options).unwrap_or_default(),
        status: ResearchStatus::parse_or_queued(&status),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

/// Run a queued research job in the background: queued → running →
/// completed with the embedded outcome, or failed with the message.
pub fn spawn_research(
    store: ResearchStore,
    driver: Arc<AgentDriver>,
    job: ResearchJob,
    caps: Capabilities,
) {
    tokio::spawn(async move {
        if let Err(e) = run_research(&store, &driver, &job, &caps).await {
            tracing::warn!(job = %job.id, "research job failed: {e}");
            if let Err(persist) = store.fail(&job.id, &e.to_string()).await {
                tracing::warn!(job = %job.id, "failed to persist research failure: {persist}");
            }
        }
    });
}

async fn run_research(
    store: &ResearchStore,
    driver: &AgentDriver,
    job: &ResearchJob,
    caps: &Capabilities,
) -> Result<()> {
    store.mark_running(&job.id).await?;
    let outcome = driver
        .deep_research(job.owner_id.as_deref(), &job.resource_ids, &job.query, caps)
        .await?;
    store.complete(&job.id, &serde_json::to_value(&outcome)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn lifecycle_roundtrip() {
        let pool = db::connect_memory().await.unwrap();
        let store = ResearchStore::new(pool);

        let options = ResearchOptions::default();
        let job = store
            .create(
                Some("u1"),
                "how does auth work?",
                &["r1".to_string()],
                &options,
            )
            .await
            .unwrap();
        assert_eq!(job.status, ResearchStatus::Queued);
        assert_eq!(job.resource_ids, vec!["r1"]);
        assert_eq!(job.query, "how does auth work?");

        store.mark_running(&job.id).await.unwrap();
        let running = store.get(&job.id).await.unwrap();
        assert_eq!(running.status, ResearchStatus::Running);
        assert!(running.started_at.is_some());

        let outcome = serde_json::json!({ "text": "it uses sessions", "sources": [] });
        store.complete(&job.id, &outcome).await.unwrap();
        let done = store.get(&job.id).await.unwrap();
        assert_eq!(done.status, ResearchStatus::Completed);
        assert_eq!(done.result.unwrap()["text"], "it uses sessions");
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_is_terminal() {
        let pool = db::connect_memory().await.unwrap();
        let store = ResearchStore::new(pool);

        let job = store
            .create(None, "query", &[], &ResearchOptions::default())
            .await
            .unwrap();
        store.mark_running(&job.id).await.unwrap();
        store.fail(&job.id, "model unavailable").await.unwrap();

        let failed = store.get(&job.id).await.unwrap();
        assert_eq!(failed.status, ResearchStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("model unavailable"));

        // A terminal row cannot be completed afterwards.
        store
            .complete(&job.id, &serde_json::json!({ "text": "late" }))
            .await
            .unwrap();
        let still_failed = store.get(&job.id).await.unwrap();
        assert_eq!(still_failed.status, ResearchStatus::Failed);
        assert!(still_failed.result.is_none());
    }

    #[tokio::test]
    async fn empty_query_rejected() {
        let pool = db::connect_memory().await.unwrap();
        let store = ResearchStore::new(pool);
        let err = store
            .create(None, "  ", &[], &ResearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
