//! Per-resource job scheduler.
//!
//! At most one worker runs per resource id across the process; jobs of the
//! same resource execute strictly in queue order, and different resources
//! proceed in parallel. A worker claims the oldest queued job, runs it
//! through the [`Indexer`], records the terminal status, and repeats until
//! the queue drains. The slot is released in a finalizer on both success
//! and failure paths.
//!
//! Per-request provider overrides live only while a worker is active: the
//! registry maps `resource_id → Overrides`, and [`Scheduler::ensure`]
//! re-primes them before each spawn. The worker re-checks the queue while
//! holding the registry lock before releasing its slot, so an `ensure`
//! racing with worker shutdown never strands a queued job — callers must
//! enqueue the job row before calling `ensure`.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::indexer::Indexer;
use crate::jobs::JobStore;
use crate::models::{IndexJob, JobKind};
use crate::providers::{Capabilities, Overrides};
use crate::repo::Materializer;

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    jobs: JobStore,
    indexer: Indexer,
    defaults: Capabilities,
    /// Active resource ids and their latest per-request overrides.
    active: Mutex<HashMap<String, Overrides>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        pool: &SqlitePool,
        config: Arc<Config>,
        materializer: Arc<Materializer>,
        defaults: Capabilities,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs: JobStore::new(pool.clone()),
                indexer: Indexer::new(pool, config, materializer),
                defaults,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record the latest overrides for a resource and spawn a worker if
    /// none is active. Call after the job row is committed.
    pub async fn ensure(&self, resource_id: &str, overrides: Overrides) {
        let mut active = self.inner.active.lock().await;
        let already_running = active.contains_key(resource_id);
        active.insert(resource_id.to_string(), overrides);
        drop(active);

        if !already_running {
            let inner = self.inner.clone();
            let resource_id = resource_id.to_string();
            tokio::spawn(async move {
                worker_loop(inner, resource_id).await;
            });
        }
    }

    /// Whether a worker is currently active for the resource.
    pub async fn is_active(&self, resource_id: &str) -> bool {
        self.inner.active.lock().await.contains_key(resource_id)
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, resource_id: String) {
    loop {
        let next = match inner.jobs.next_queued(&resource_id).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(resource = %resource_id, "queue read failed: {e}");
                None
            }
        };

        match next {
            Some(job) => run_job(&inner, &resource_id, &job).await,
            None => {
                // Final check under the registry lock: an ensure() that
                // raced us either sees our slot or we see its job.
                let mut active = inner.active.lock().await;
                match inner.jobs.next_queued(&resource_id).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => {
                        active.remove(&resource_id);
                        break;
                    }
                }
            }
        }
    }
}

async fn run_job(inner: &SchedulerInner, resource_id: &str, job: &IndexJob) {
    // Overrides are volatile: resolved fresh before each job, discarded
    // with the slot.
    let caps = {
        let active = inner.active.lock().await;
        let overrides = active.get(resource_id).cloned().unwrap_or_default();
        inner.defaults.with_overrides(&overrides)
    };

    if let Err(e) = inner.jobs.mark_running(&job.id).await {
        tracing::warn!(job = %job.id, "failed to mark running: {e}");
        return;
    }
    tracing::info!(job = %job.id, kind = job.kind.as_str(), resource = %resource_id, "job started");

    let outcome: Result<()> = match job.kind {
        JobKind::Sync => inner.indexer.run_sync(resource_id, &job.id).await,
        JobKind::Index => inner.indexer.run_index(resource_id, &job.id, &caps).await,
    };

    let terminal = match outcome {
        Ok(()) => inner.jobs.mark_completed(&job.id).await,
        Err(e) => inner.jobs.mark_failed(&job.id, &e.to_string()).await,
    };
    if let Err(e) = terminal {
        tracing::warn!(job = %job.id, "failed to record terminal status: {e}");
    }
}
