use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::job::{Job, JobId, JobStatus, ListFilter, MetricsSnapshot};

use super::{Result, StoreError, RETRY_BACKOFF};

/// Ephemeral job store holding everything in process memory.
///
/// Implements the same claim and transition contract as [`super::PgStore`];
/// the claim scan runs under one lock, so no two concurrent claimers can
/// receive the same job. Nothing survives a restart, which makes this the
/// backend for tests and for embedding without a database.
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    retry_backoff: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retry_backoff: RETRY_BACKOFF,
        }
    }

    /// Override the fixed retry backoff. Tests use this to exercise the
    /// retry path without waiting out the production delay.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn scoped_mut<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    id: JobId,
    owner: Option<Uuid>,
) -> Result<&'a mut Job> {
    let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
    if let Some(owner) = owner {
        if job.owner != Some(owner) {
            return Err(StoreError::NotFound);
        }
    }
    Ok(job)
}

fn in_scope(job: &Job, owner: Option<Uuid>) -> bool {
    match owner {
        Some(owner) => job.owner == Some(owner),
        None => true,
    }
}

#[async_trait]
impl super::Store for MemoryStore {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.lock();

        let next = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Retry) && j.run_at <= now
            })
            .min_by_key(|j| (j.run_at, j.created_at, j.id.0))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_done(&self, id: JobId) -> Result<()> {
        let mut jobs = self.lock();
        let job = scoped_mut(&mut jobs, id, None)?;
        job.status = JobStatus::Done;
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<()> {
        let mut jobs = self.lock();
        let job = scoped_mut(&mut jobs, id, None)?;
        job.status = JobStatus::Failed;
        job.last_error = Some(reason.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_retry(&self, id: JobId, reason: &str, owner: Option<Uuid>) -> Result<()> {
        let now = Utc::now();
        let mut jobs = self.lock();
        let job = scoped_mut(&mut jobs, id, owner)?;
        job.status = JobStatus::Retry;
        job.last_error = Some(reason.to_string());
        job.run_at = now + chrono::Duration::from_std(self.retry_backoff).unwrap_or_default();
        job.updated_at = now;
        Ok(())
    }

    async fn mark_pending(&self, id: JobId, owner: Option<Uuid>) -> Result<()> {
        let now = Utc::now();
        let mut jobs = self.lock();
        let job = scoped_mut(&mut jobs, id, owner)?;
        job.status = JobStatus::Pending;
        job.run_at = now;
        job.updated_at = now;
        Ok(())
    }

    async fn cancel(&self, id: JobId, reason: &str, owner: Option<Uuid>) -> Result<()> {
        let mut jobs = self.lock();
        let job = scoped_mut(&mut jobs, id, owner)?;
        job.status = JobStatus::Failed;
        job.last_error = Some(reason.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Job>> {
        let jobs = self.lock();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| in_scope(j, filter.owner))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matched
            .into_iter()
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn count_by_status(&self, owner: Option<Uuid>) -> Result<HashMap<JobStatus, i64>> {
        let jobs = self.lock();
        let mut counts = HashMap::new();
        for job in jobs.values().filter(|j| in_scope(j, owner)) {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn metrics(&self, owner: Option<Uuid>) -> Result<MetricsSnapshot> {
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let jobs = self.lock();
        let mut snap = MetricsSnapshot::default();

        for job in jobs.values().filter(|j| in_scope(j, owner)) {
            snap.total += 1;
            match job.status {
                JobStatus::Pending => snap.pending += 1,
                JobStatus::Running => snap.running += 1,
                JobStatus::Retry => snap.retry += 1,
                JobStatus::Failed => {
                    snap.failed += 1;
                    if job.updated_at >= hour_ago {
                        snap.failed_last_hour += 1;
                    }
                }
                JobStatus::Done => {
                    snap.done += 1;
                    if job.updated_at >= hour_ago {
                        snap.done_last_hour += 1;
                    }
                }
            }
            if matches!(job.status, JobStatus::Pending | JobStatus::Retry) {
                snap.next_scheduled = match snap.next_scheduled {
                    Some(at) if at <= job.run_at => Some(at),
                    _ => Some(job.run_at),
                };
            }
        }
        Ok(snap)
    }

    async fn recover_stuck(&self, stale_after: chrono::Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - stale_after;
        let mut jobs = self.lock();
        let mut recovered = 0;

        for job in jobs.values_mut() {
            if job.status != JobStatus::Running || job.updated_at >= cutoff {
                continue;
            }
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.last_error = Some("worker lost; attempts exhausted".to_string());
            } else {
                job.status = JobStatus::Retry;
            }
            job.run_at = now;
            job.updated_at = now;
            recovered += 1;
        }
        Ok(recovered)
    }
}
