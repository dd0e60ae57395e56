use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// Error type for job execution
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    #[error("payload deserialization: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Build an execution error from any displayable cause.
    pub fn execution(cause: impl ToString) -> Self {
        JobError::Execution(cause.to_string())
    }
}

pub type JobResult = Result<(), JobError>;

type BoxedHandler = Arc<
    dyn Fn(JobContext, Job) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync,
>;

/// Per-execution metadata handed to handlers as an explicit argument.
///
/// `cancel` is a clone of the pool's shutdown token; long handlers should
/// poll it if they want to cooperate with shutdown.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub worker_index: usize,
    pub attempt: i32,
    pub cancel: CancellationToken,
}

struct RegisteredHandler {
    handler: BoxedHandler,
    timeout: Option<Duration>,
}

/// Name-to-handler lookup table.
///
/// Registration takes `&mut self`; the queue wraps the finished registry in
/// an `Arc`, so workers share a read-only table and nothing can be
/// registered once the pool is running.
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for the named job.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.insert(name.into(), handler, None);
    }

    /// Register a handler whose execution is aborted after `timeout`,
    /// counting as a handler error.
    pub fn register_with_timeout<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        timeout: Duration,
    ) where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.insert(name.into(), handler, Some(timeout));
    }

    fn insert<F, Fut>(&mut self, name: String, handler: F, timeout: Option<Duration>)
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |ctx: JobContext, job: Job| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(ctx, job).await })
        });

        self.handlers.insert(
            name,
            RegisteredHandler {
                handler: boxed,
                timeout,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Execute a job using its registered handler.
    ///
    /// The handler future runs in its own task so a panic converts to an
    /// execution error instead of taking the worker down.
    pub async fn execute(&self, ctx: JobContext, job: &Job) -> JobResult {
        let (handler, timeout) = {
            let reg = self
                .handlers
                .get(&job.name)
                .ok_or_else(|| JobError::HandlerNotFound(job.name.clone()))?;
            (Arc::clone(&reg.handler), reg.timeout)
        };

        let future = handler(ctx, job.clone());
        let mut handle = tokio::spawn(future);

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                JobError::Execution("handler panicked".to_string())
            } else {
                JobError::Execution("handler cancelled".to_string())
            }
        };

        match timeout {
            Some(duration) => {
                tokio::select! {
                    res = &mut handle => res.map_err(join_to_error)?,
                    _ = tokio::time::sleep(duration) => {
                        handle.abort();
                        Err(JobError::Timeout(duration))
                    }
                }
            }
            None => handle.await.map_err(join_to_error)?,
        }
    }
}
