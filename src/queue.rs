use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::job::{Job, JobId, JobStatus, ListFilter, MetricsSnapshot, DEFAULT_MAX_ATTEMPTS};
use crate::registry::HandlerRegistry;
use crate::store::{PgStore, Store, StoreError};
use crate::tenant::{Caller, TenantResolver};
use crate::worker::Worker;

/// Accepted bounds for an enqueue request's attempt ceiling.
pub const MIN_ATTEMPTS: i32 = 1;
pub const MAX_ATTEMPTS: i32 = 25;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A request to enqueue a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

impl EnqueueRequest {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            run_at: None,
            max_attempts: None,
        }
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A single field that failed enqueue validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid enqueue request")]
    Invalid(Vec<FieldError>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Job queue coordinator: owns the store, the handler registry, and the
/// worker pool, and exposes the management surface.
pub struct JobQueue {
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    resolver: Option<Arc<dyn TenantResolver>>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Connect to Postgres and ensure the schema exists.
    ///
    /// Register all handlers on the registry before constructing the
    /// queue; the pool shares it read-only.
    pub async fn connect(
        database_url: &str,
        registry: HandlerRegistry,
    ) -> Result<Self, StoreError> {
        let store = PgStore::connect(database_url).await?;
        Ok(Self::with_store(Arc::new(store), registry))
    }

    /// Build a queue on any store backend.
    pub fn with_store(store: Arc<dyn Store>, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config: QueueConfig::default(),
            resolver: None,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tenant_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Spawn the worker pool.
    pub fn start(&mut self) {
        for index in 0..self.config.worker_count {
            let worker = Worker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                index,
                self.config.poll_interval,
            );
            let shutdown = self.shutdown.clone();
            self.worker_handles.push(tokio::spawn(async move {
                worker.run(shutdown).await;
            }));
        }
        info!(workers = self.config.worker_count, "job queue started");
    }

    /// Token bound to the pool's lifetime, for external shutdown control.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the pool and wait for workers to exit their current tick.
    pub async fn shutdown(&mut self) {
        info!("initiating shutdown");
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        info!("shutdown complete");
    }

    /// Block until Ctrl+C, then shut down gracefully.
    pub async fn wait_for_shutdown(&mut self) {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        self.shutdown().await;
    }

    /// Requeue jobs left in running by a worker that disappeared.
    /// Typically called once at startup, before `start()`.
    pub async fn recover_stuck(&self, stale_after: chrono::Duration) -> Result<u64, StoreError> {
        self.store.recover_stuck(stale_after).await
    }

    /// Validate and persist a new pending job, returning its id.
    pub async fn enqueue(
        &self,
        req: EnqueueRequest,
        caller: &Caller,
    ) -> Result<JobId, EnqueueError> {
        let name = req.name.trim().to_string();
        let max_attempts = req.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let mut fields = Vec::new();
        if name.is_empty() {
            fields.push(FieldError {
                field: "name",
                message: "must not be empty".to_string(),
            });
        }
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&max_attempts) {
            fields.push(FieldError {
                field: "max_attempts",
                message: format!("must be between {MIN_ATTEMPTS} and {MAX_ATTEMPTS}"),
            });
        }
        if !fields.is_empty() {
            return Err(EnqueueError::Invalid(fields));
        }

        let payload = if req.payload.is_null() {
            serde_json::json!({})
        } else {
            req.payload
        };

        let mut job = Job::new(name, payload).with_max_attempts(max_attempts);
        if let Some(run_at) = req.run_at {
            job = job.with_run_at(run_at);
        }
        if let Some(owner) = self.resolve_owner(caller) {
            job = job.with_owner(owner);
        }

        let id = job.id;
        self.store.enqueue(job).await?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// List jobs visible to the caller, newest first.
    pub async fn list(
        &self,
        mut filter: ListFilter,
        caller: &Caller,
    ) -> Result<Vec<Job>, StoreError> {
        filter.owner = self.resolve_owner(caller);
        self.store.list(filter).await
    }

    /// Force a job back to pending, making it immediately eligible.
    pub async fn retry(&self, id: JobId, caller: &Caller) -> Result<(), StoreError> {
        self.store
            .mark_pending(id, self.resolve_owner(caller))
            .await
    }

    /// Force a job to failed with an operator-supplied reason.
    pub async fn cancel(
        &self,
        id: JobId,
        reason: &str,
        caller: &Caller,
    ) -> Result<(), StoreError> {
        self.store
            .cancel(id, reason, self.resolve_owner(caller))
            .await
    }

    pub async fn metrics(&self, caller: &Caller) -> Result<MetricsSnapshot, StoreError> {
        self.store.metrics(self.resolve_owner(caller)).await
    }

    pub async fn count_by_status(
        &self,
        caller: &Caller,
    ) -> Result<HashMap<JobStatus, i64>, StoreError> {
        self.store.count_by_status(self.resolve_owner(caller)).await
    }

    fn resolve_owner(&self, caller: &Caller) -> Option<Uuid> {
        self.resolver.as_ref().and_then(|r| r.resolve(caller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::with_store(Arc::new(MemoryStore::new()), HandlerRegistry::new())
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_name() {
        let queue = queue();
        let req = EnqueueRequest::new("   ", json!({}));

        let err = queue.enqueue(req, &Caller::anonymous()).await.unwrap_err();
        match err {
            EnqueueError::Invalid(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "name");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_out_of_range_attempts() {
        let queue = queue();

        for bad in [0, -1, 26] {
            let req = EnqueueRequest::new("send_email", json!({})).max_attempts(bad);
            let err = queue.enqueue(req, &Caller::anonymous()).await.unwrap_err();
            match err {
                EnqueueError::Invalid(fields) => {
                    assert_eq!(fields[0].field, "max_attempts");
                }
                other => panic!("expected validation error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn enqueue_reports_all_invalid_fields() {
        let queue = queue();
        let req = EnqueueRequest::new("", json!({})).max_attempts(0);

        let err = queue.enqueue(req, &Caller::anonymous()).await.unwrap_err();
        match err {
            EnqueueError::Invalid(fields) => {
                let names: Vec<_> = fields.iter().map(|f| f.field).collect();
                assert_eq!(names, vec!["name", "max_attempts"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let queue = queue();
        let req = EnqueueRequest::new("send_email", serde_json::Value::Null);

        let id = queue.enqueue(req, &Caller::anonymous()).await.unwrap();
        let job = queue.store.get(id).await.unwrap().unwrap();

        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.payload, json!({}));
        assert!(job.run_at <= Utc::now());
    }

    #[tokio::test]
    async fn enqueue_honors_run_at_and_attempts() {
        let queue = queue();
        let later = Utc::now() + chrono::Duration::hours(2);
        let req = EnqueueRequest::new("send_email", json!({}))
            .run_at(later)
            .max_attempts(7);

        let id = queue.enqueue(req, &Caller::anonymous()).await.unwrap();
        let job = queue.store.get(id).await.unwrap().unwrap();

        assert_eq!(job.run_at, later);
        assert_eq!(job.max_attempts, 7);
    }
}
