use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::error::QueueResult;
use super::job::{Claim, ExpiredJob, JobState, StateCounts, TranscodeJob};

/// Authoritative per-job state, shared by every worker and the API.
///
/// Transitions are compare-and-set: a job moves `pending -> active` through
/// `claim` only, and leaves `active` only for the worker holding the lease
/// (or through `requeue_expired` once that lease has lapsed).
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Records a new `pending` job. Overwrites nothing: an existing id is kept.
    async fn create(&self, job: &TranscodeJob) -> QueueResult<()>;

    async fn get(&self, job_id: Uuid) -> QueueResult<Option<TranscodeJob>>;

    /// Takes a `pending` job, or an `active` one whose lease expired, and
    /// bumps its attempt count.
    async fn claim(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> QueueResult<Claim>;

    /// Extends the lease. `false` when the caller no longer owns the job.
    async fn renew(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> QueueResult<bool>;

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> QueueResult<bool>;

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &str) -> QueueResult<bool>;

    /// Hands an owned job back to `pending`, used on shutdown.
    async fn release(&self, job_id: Uuid, worker_id: &str) -> QueueResult<bool>;

    /// Moves every `active` job with a lapsed lease back to `pending`.
    async fn requeue_expired(&self) -> QueueResult<Vec<ExpiredJob>>;

    async fn remove(&self, job_id: Uuid) -> QueueResult<()>;

    async fn counts(&self) -> QueueResult<StateCounts>;

    /// Jobs in `state`, oldest first.
    async fn list(&self, state: JobState, offset: usize, limit: usize) -> QueueResult<Vec<TranscodeJob>>;
}
