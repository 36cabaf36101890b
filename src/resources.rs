//! Persisted resource metadata.
//!
//! A [`Resource`] row tracks the two lifecycles of an indexed unit: content
//! (materialized files on disk) and vectors (chunks + embeddings). Deleting
//! a resource cascades to its chunks and jobs via foreign keys.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    ContentStatus, NewResource, Resource, ResourceKind, Scope, VectorStatus,
};

/// CRUD over the `resources` table.
#[derive(Clone)]
pub struct ResourceStore {
    pool: SqlitePool,
}

impl ResourceStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a resource.
    ///
    /// # Errors
    ///
    /// `Validation` when the kind/url/path/project-key combination is
    /// inconsistent; `Conflict` when the `(owner, scope, project_key, name)`
    /// tuple is already taken.
    pub async fn create(&self, input: NewResource) -> Result<Resource> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("name must not be empty".to_string()));
        }
        let scope = input.scope.unwrap_or(Scope::Global);
        let kind = input
            .kind
            .ok_or_else(|| Error::Validation("kind is required".to_string()))?;

        if scope == Scope::Project && input.project_key.trim().is_empty() {
            return Err(Error::Validation(
                "project_key is required for project scope".to_string(),
            ));
        }
        let project_key = if scope == Scope::Global {
            String::new()
        } else {
            input.project_key.trim().to_string()
        };

        match kind {
            ResourceKind::Git => {
                if input.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(Error::Validation(
                        "url is required for git resources".to_string(),
                    ));
                }
            }
            ResourceKind::Local => {
                if input.path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                    return Err(Error::Validation(
                        "path is required for local resources".to_string(),
                    ));
                }
            }
        }

        let taken: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM resources \
             WHERE COALESCE(owner_id, '') = COALESCE(?, '') \
               AND scope = ? AND project_key = ? AND name = ?",
        )
        .bind(&input.owner_id)
        .bind(scope.as_str())
        .bind(&project_key)
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;
        if taken.is_some() {
            return Err(Error::Conflict(format!(
                "resource '{name}' already exists in this scope"
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_secs();
        let paths_json = serde_json::to_string(&input.paths)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO resources
                (id, owner_id, name, scope, project_key, kind, url, path, branch,
                 commit_sha, paths, notes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&input.owner_id)
        .bind(&name)
        .bind(scope.as_str())
        .bind(&project_key)
        .bind(kind.as_str())
        .bind(&input.url)
        .bind(&input.path)
        .bind(&input.branch)
        .bind(&input.commit)
        .bind(&paths_json)
        .bind(&input.notes)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get(&id).await,
            // The unique index backs up the pre-check under concurrency.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::Conflict(
                format!("resource '{name}' already exists in this scope"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Resource> {
        let row = sqlx::query("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| resource_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))
    }

    /// List resources visible to `owner_id`, optionally restricted to ids.
    ///
    /// Ownerless (shared) resources are visible to every caller.
    pub async fn list(&self, owner_id: Option<&str>, ids: &[String]) -> Result<Vec<Resource>> {
        let rows = sqlx::query(
            "SELECT * FROM resources \
             WHERE (owner_id IS NULL OR ? IS NULL OR owner_id = ?) \
             ORDER BY created_at, id",
        )
        .bind(owner_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut resources = Vec::with_capacity(rows.len());
        for row in &rows {
            let resource = resource_from_row(row)?;
            if ids.is_empty() || ids.contains(&resource.id) {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("resource {id}")));
        }
        Ok(())
    }

    pub async fn set_content_status(
        &self,
        id: &str,
        status: ContentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE resources SET content_status = ?, content_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_secs())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_vector_status(
        &self,
        id: &str,
        status: VectorStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE resources SET vector_status = ?, vector_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_secs())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a successful sync: commits, staleness flag, timestamp.
    /// `update_available` is `None` when either commit is unknown; the
    /// stored flag is left untouched in that case.
    pub async fn record_sync(
        &self,
        id: &str,
        local_commit: Option<&str>,
        remote_commit: Option<&str>,
        update_available: Option<bool>,
    ) -> Result<()> {
        let now = now_secs();
        match update_available {
            Some(flag) => {
                sqlx::query(
                    "UPDATE resources SET content_status = 'ready', content_error = NULL, \
                     last_local_commit = ?, last_remote_commit = ?, update_available = ?, \
                     last_synced_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(local_commit)
                .bind(remote_commit)
                .bind(i64::from(flag))
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE resources SET content_status = 'ready', content_error = NULL, \
                     last_local_commit = ?, last_remote_commit = ?, \
                     last_synced_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(local_commit)
                .bind(remote_commit)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Record a successful index: chunk count and timestamp.
    pub async fn record_index(&self, id: &str, chunk_count: i64) -> Result<()> {
        let now = now_secs();
        sqlx::query(
            "UPDATE resources SET vector_status = 'ready', vector_error = NULL, \
             chunk_count = ?, last_indexed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write back an update-checker pass.
    pub async fn record_update_check(
        &self,
        id: &str,
        local_commit: Option<&str>,
        remote_commit: Option<&str>,
        update_available: Option<bool>,
    ) -> Result<()> {
        let now = now_secs();
        match update_available {
            Some(flag) => {
                sqlx::query(
                    "UPDATE resources SET last_local_commit = ?, last_remote_commit = ?, \
                     update_available = ?, last_update_check_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(local_commit)
                .bind(remote_commit)
                .bind(i64::from(flag))
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE resources SET last_update_check_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

fn resource_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Resource> {
    let scope: String = row.get("scope");
    let kind: String = row.get("kind");
    let content_status: String = row.get("content_status");
    let vector_status: String = row.get("vector_status");
    let paths_json: String = row.get("paths");
    let update_available: i64 = row.get("update_available");

    Ok(Resource {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        scope: Scope::parse(&scope)?,
        project_key: row.get("project_key"),
        kind: ResourceKind::parse(&kind)?,
        url: row.get("url"),
        path: row.get("path"),
        branch: row.get("branch"),
        commit: row.get("commit_sha"),
        paths: serde_json::from_str(&paths_json).unwrap_or_default(),
        notes: row.get("notes"),
        content_status: ContentStatus::parse_or_missing(&content_status),
        vector_status: VectorStatus::parse_or_missing(&vector_status),
        content_error: row.get("content_error"),
        vector_error: row.get("vector_error"),
        chunk_count: row.get("chunk_count"),
        last_synced_at: row.get("last_synced_at"),
        last_indexed_at: row.get("last_indexed_at"),
        last_local_commit: row.get("last_local_commit"),
        last_remote_commit: row.get("last_remote_commit"),
        update_available: update_available != 0,
        last_update_check_at: row.get("last_update_check_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
