mod job;
mod queue;
mod registry;
mod store;
mod tenant;
mod worker;

pub use job::{Job, JobId, JobStatus, ListFilter, MetricsSnapshot, DEFAULT_MAX_ATTEMPTS};
pub use queue::{
    EnqueueError, EnqueueRequest, FieldError, JobQueue, QueueConfig, MAX_ATTEMPTS, MIN_ATTEMPTS,
};
pub use registry::{HandlerRegistry, JobContext, JobError, JobResult};
pub use store::{MemoryStore, PgStore, Store, StoreError, RETRY_BACKOFF};
pub use tenant::{Caller, SubjectResolver, TenantResolver};
