pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::job::{Job, JobId, JobStatus, ListFilter, MetricsSnapshot};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Fixed delay added to `run_at` after a retryable failure.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(15);

/// Upper bound on a single claim attempt, independent of pool shutdown.
pub(crate) const CLAIM_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("duplicate job id: {0}")]
    Duplicate(JobId),

    #[error("job not found")]
    NotFound,

    #[error("claim timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Sole authority for job persistence and atomic state transitions.
///
/// Status is only ever mutated through the claim and transition operations
/// below; `claim_next` must never hand the same job to two concurrent
/// callers. Transition targets that match no row (including an owner-scope
/// mismatch) surface as [`StoreError::NotFound`] with no mutation.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new pending job.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Atomically claim the earliest eligible job, flipping it to running
    /// and incrementing its attempt count. `Ok(None)` means no job is
    /// currently eligible, which is a benign outcome.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Terminal success; clears `last_error`.
    async fn mark_done(&self, id: JobId) -> Result<()>;

    /// Terminal failure; records the reason.
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<()>;

    /// Schedule a retry after the fixed backoff, recording the reason.
    async fn mark_retry(&self, id: JobId, reason: &str, owner: Option<Uuid>) -> Result<()>;

    /// Force immediate re-eligibility.
    async fn mark_pending(&self, id: JobId, owner: Option<Uuid>) -> Result<()>;

    /// Force failed from any prior status.
    async fn cancel(&self, id: JobId, reason: &str, owner: Option<Uuid>) -> Result<()>;

    /// Fetch a single job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Filtered, paginated listing, newest first.
    async fn list(&self, filter: ListFilter) -> Result<Vec<Job>>;

    /// Per-status totals.
    async fn count_by_status(&self, owner: Option<Uuid>) -> Result<HashMap<JobStatus, i64>>;

    /// Aggregate statistics including rolling-hour outcomes.
    async fn metrics(&self, owner: Option<Uuid>) -> Result<MetricsSnapshot>;

    /// Requeue running jobs whose worker disappeared. Rows stuck in
    /// `running` with `updated_at` older than `stale_after` move back to
    /// retry, or to failed once the attempt budget is spent. Returns the
    /// number of rows touched.
    async fn recover_stuck(&self, stale_after: chrono::Duration) -> Result<u64>;
}
