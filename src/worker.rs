use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::Job;
use crate::registry::{HandlerRegistry, JobContext, JobError};
use crate::store::{Store, StoreError};

/// A single polling loop claiming and executing jobs.
pub(crate) struct Worker {
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    index: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        index: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            index,
            poll_interval,
        }
    }

    /// Run until shutdown is signaled. Shutdown is observed between ticks;
    /// an in-flight handler is never preempted by it.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = self.index, "worker started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker = self.index, "worker shutting down");
                    break;
                }
                _ = ticker.tick() => self.poll(&shutdown).await,
            }
        }
    }

    async fn poll(&self, shutdown: &CancellationToken) {
        match self.store.claim_next().await {
            Ok(Some(job)) => self.process(job, shutdown).await,
            Ok(None) => {}
            Err(e) => {
                // Transient; the next tick retries.
                error!(worker = self.index, error = %e, "failed to claim job");
            }
        }
    }

    async fn process(&self, job: Job, shutdown: &CancellationToken) {
        debug!(job_id = %job.id, name = %job.name, worker = self.index, attempt = job.attempts, "job claimed");

        let ctx = JobContext {
            worker_index: self.index,
            attempt: job.attempts,
            cancel: shutdown.clone(),
        };

        info!(job_id = %job.id, name = %job.name, worker = self.index, "job started");

        match self.registry.execute(ctx, &job).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_done(job.id).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job done");
                    return;
                }
                info!(job_id = %job.id, name = %job.name, "job completed");
            }
            Err(err) => {
                warn!(job_id = %job.id, name = %job.name, error = %err, "job errored");
                if let Err(e) = self.settle_failure(&job, err).await {
                    error!(job_id = %job.id, error = %e, "failed to record job failure");
                }
            }
        }
    }

    /// Route a handler error to retry or terminal failure.
    async fn settle_failure(&self, job: &Job, err: JobError) -> Result<(), StoreError> {
        // No future claim can resolve a missing handler without a code
        // change, so fail immediately instead of burning the budget.
        if matches!(err, JobError::HandlerNotFound(_)) {
            warn!(job_id = %job.id, name = %job.name, "job handler missing");
            return self.store.mark_failed(job.id, "handler missing").await;
        }

        // `attempts` was already incremented by the claim.
        if job.attempts >= job.max_attempts {
            warn!(job_id = %job.id, attempts = job.attempts, "job failed permanently");
            return self.store.mark_failed(job.id, &err.to_string()).await;
        }

        info!(
            job_id = %job.id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "job scheduled for retry"
        );
        self.store.mark_retry(job.id, &err.to_string(), None).await
    }
}
