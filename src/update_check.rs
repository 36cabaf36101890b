//! Background staleness detection for git resources.
//!
//! Fire-and-forget: triggered after query operations, compares each ready
//! git resource's local HEAD against its remote branch head and writes the
//! result back. Every failure path degrades gracefully — log and move on.

use std::path::PathBuf;
use std::sync::Arc;

use crate::models::{ContentStatus, ResourceKind};
use crate::repo::GitProbe;
use crate::resources::ResourceStore;

pub struct UpdateChecker {
    resources: ResourceStore,
    probe: Arc<dyn GitProbe>,
    repos_root: PathBuf,
}

impl UpdateChecker {
    #[must_use]
    pub fn new(resources: ResourceStore, probe: Arc<dyn GitProbe>, repos_root: PathBuf) -> Self {
        Self {
            resources,
            probe,
            repos_root,
        }
    }

    /// Spawn a background pass over the given resources.
    pub fn schedule(self: &Arc<Self>, resource_ids: Vec<String>) {
        if resource_ids.is_empty() {
            return;
        }
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            checker.run(&resource_ids).await;
        });
    }

    /// Check each resource in turn. Failures are logged and swallowed.
    pub async fn run(&self, resource_ids: &[String]) {
        for id in resource_ids {
            if let Err(e) = self.check_one(id).await {
                tracing::warn!(resource = %id, "update check failed: {e}");
            }
        }
    }

    async fn check_one(&self, resource_id: &str) -> crate::error::Result<()> {
        let resource = self.resources.get(resource_id).await?;
        if resource.kind != ResourceKind::Git || resource.content_status != ContentStatus::Ready {
            return Ok(());
        }

        let dir = self.repos_root.join(&resource.id);
        if !dir.is_dir() {
            // Nothing materialized: record the attempt only.
            return self
                .resources
                .record_update_check(resource_id, None, None, None)
                .await;
        }

        let local = self.probe.head_commit(&dir).await;
        let remote = match (&resource.url, &resource.branch) {
            (Some(url), Some(branch)) => self.probe.remote_head(url, branch).await,
            _ => None,
        };
        let update_available = stale(local.as_deref(), remote.as_deref());

        self.resources
            .record_update_check(
                resource_id,
                local.as_deref(),
                remote.as_deref(),
                update_available,
            )
            .await
    }
}

/// The staleness decision: `Some(local != remote)` when both SHAs are
/// known, `None` otherwise.
#[must_use]
pub fn stale(local: Option<&str>, remote: Option<&str>) -> Option<bool> {
    match (local, remote) {
        (Some(l), Some(r)) => Some(l != r),
        _ => None,
    }
}
