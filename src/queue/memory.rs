//! In-process ledger with the same transition rules as the Redis one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::QueueResult;
use super::job::{Claim, ExpiredJob, JobState, StateCounts, TranscodeJob};
use super::ledger::JobLedger;

fn lease_deadline(lease: Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc() + lease
}

#[derive(Default)]
pub struct MemoryJobLedger {
    jobs: Mutex<HashMap<Uuid, TranscodeJob>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, job_id: Uuid) -> Option<JobState> {
        self.jobs.lock().unwrap().get(&job_id).map(|j| j.state)
    }

    /// Rewrites the lease deadline, e.g. to simulate a crashed worker.
    pub fn expire_lease(&self, job_id: Uuid) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.lease_expires_at = Some(OffsetDateTime::now_utc() - Duration::from_secs(1));
        }
    }

    fn finish(&self, job_id: Uuid, worker_id: &str, target: JobState, error: Option<&str>) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return false;
        };
        if job.state != JobState::Active || job.lease_owner.as_deref() != Some(worker_id) {
            return false;
        }

        job.state = target;
        job.state_changed_at = OffsetDateTime::now_utc();
        job.lease_owner = None;
        job.lease_expires_at = None;
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        true
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn create(&self, job: &TranscodeJob) -> QueueResult<()> {
        self.jobs
            .lock()
            .unwrap()
            .entry(job.job_id)
            .or_insert_with(|| job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> QueueResult<Option<TranscodeJob>> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn claim(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> QueueResult<Claim> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(Claim::Missing);
        };

        let now = OffsetDateTime::now_utc();
        match job.state {
            JobState::Completed | JobState::Failed => return Ok(Claim::Finished(job.state)),
            JobState::Active if job.lease_expires_at.is_some_and(|at| at > now) => {
                return Ok(Claim::Busy {
                    lease_owner: job.lease_owner.clone(),
                });
            }
            _ => {}
        }

        let previous = job.state;
        let previous_since = job.state_changed_at;
        job.state = JobState::Active;
        job.state_changed_at = now;
        job.attempt_count += 1;
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(lease_deadline(lease));

        Ok(Claim::Claimed {
            job: job.clone(),
            previous,
            previous_since,
        })
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> QueueResult<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Active && job.lease_owner.as_deref() == Some(worker_id) => {
                job.lease_expires_at = Some(lease_deadline(lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> QueueResult<bool> {
        Ok(self.finish(job_id, worker_id, JobState::Completed, None))
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &str) -> QueueResult<bool> {
        Ok(self.finish(job_id, worker_id, JobState::Failed, Some(error)))
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> QueueResult<bool> {
        Ok(self.finish(job_id, worker_id, JobState::Pending, None))
    }

    async fn requeue_expired(&self) -> QueueResult<Vec<ExpiredJob>> {
        let now = OffsetDateTime::now_utc();
        let mut moved = Vec::new();
        for job in self.jobs.lock().unwrap().values_mut() {
            if job.state == JobState::Active && job.lease_expires_at.is_none_or(|at| at <= now) {
                moved.push(ExpiredJob {
                    job_id: job.job_id,
                    lecture_id: job.lecture_id,
                    active_since: job.state_changed_at,
                });
                job.state = JobState::Pending;
                job.state_changed_at = now;
                job.lease_owner = None;
                job.lease_expires_at = None;
            }
        }
        Ok(moved)
    }

    async fn remove(&self, job_id: Uuid) -> QueueResult<()> {
        self.jobs.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn counts(&self) -> QueueResult<StateCounts> {
        let mut counts = StateCounts::default();
        for job in self.jobs.lock().unwrap().values() {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list(&self, state: JobState, offset: usize, limit: usize) -> QueueResult<Vec<TranscodeJob>> {
        let mut jobs: Vec<TranscodeJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(60);

    fn job() -> TranscodeJob {
        TranscodeJob::new(Uuid::new_v4(), PathBuf::from("/staging/j/source.mp4"), "intro-abc123".into())
    }

    #[tokio::test]
    async fn only_one_worker_wins_a_claim() {
        let ledger = MemoryJobLedger::new();
        let job = job();
        ledger.create(&job).await.unwrap();

        let first = ledger.claim(job.job_id, "worker-a", LEASE).await.unwrap();
        let second = ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap();

        assert!(matches!(first, Claim::Claimed { previous: JobState::Pending, .. }));
        match second {
            Claim::Busy { lease_owner } => assert_eq!(lease_owner.as_deref(), Some("worker-a")),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_a_single_winner() {
        let ledger = Arc::new(MemoryJobLedger::new());
        let job = job();
        ledger.create(&job).await.unwrap();

        let claims = (0..8).map(|n| {
            let ledger = ledger.clone();
            let job_id = job.job_id;
            tokio::spawn(async move { ledger.claim(job_id, &format!("worker-{n}"), LEASE).await.unwrap() })
        });
        let claims = futures_util::future::join_all(claims).await;

        let winners = claims
            .iter()
            .filter(|c| matches!(c, Ok(Claim::Claimed { .. })))
            .count();
        let busy = claims
            .iter()
            .filter(|c| matches!(c, Ok(Claim::Busy { .. })))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(busy, 7);
        assert_eq!(ledger.get(job.job_id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn finished_jobs_are_never_reclaimed() {
        let ledger = MemoryJobLedger::new();
        let job = job();
        ledger.create(&job).await.unwrap();
        ledger.claim(job.job_id, "worker-a", LEASE).await.unwrap();

        assert!(!ledger.complete(job.job_id, "worker-b").await.unwrap());
        assert!(ledger.complete(job.job_id, "worker-a").await.unwrap());
        assert!(!ledger.fail(job.job_id, "worker-a", "late").await.unwrap());

        let claim = ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap();
        assert!(matches!(claim, Claim::Finished(JobState::Completed)));
    }

    #[tokio::test]
    async fn expired_leases_go_back_to_pending() {
        let ledger = MemoryJobLedger::new();
        let job = job();
        ledger.create(&job).await.unwrap();
        ledger.claim(job.job_id, "worker-a", LEASE).await.unwrap();

        assert!(ledger.requeue_expired().await.unwrap().is_empty());

        ledger.expire_lease(job.job_id);
        let moved = ledger.requeue_expired().await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].job_id, job.job_id);
        assert_eq!(moved[0].lecture_id, job.lecture_id);
        assert_eq!(ledger.state(job.job_id), Some(JobState::Pending));

        // The dead worker can no longer finish it.
        assert!(!ledger.complete(job.job_id, "worker-a").await.unwrap());

        match ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap() {
            Claim::Claimed { job, .. } => assert_eq!(job.attempt_count, 2),
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over_directly() {
        let ledger = MemoryJobLedger::new();
        let job = job();
        ledger.create(&job).await.unwrap();
        ledger.claim(job.job_id, "worker-a", LEASE).await.unwrap();
        ledger.expire_lease(job.job_id);

        let claim = ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap();
        assert!(matches!(claim, Claim::Claimed { previous: JobState::Active, .. }));
        assert!(!ledger.renew(job.job_id, "worker-a", LEASE).await.unwrap());
        assert!(ledger.renew(job.job_id, "worker-b", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn counts_and_lists_by_state() {
        let ledger = MemoryJobLedger::new();
        let jobs: Vec<_> = (0..3).map(|_| job()).collect();
        for job in &jobs {
            ledger.create(job).await.unwrap();
        }
        ledger.claim(jobs[0].job_id, "w", LEASE).await.unwrap();
        ledger.fail(jobs[0].job_id, "w", "encoder exited").await.unwrap();

        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts, StateCounts { pending: 2, active: 0, completed: 0, failed: 1 });
        assert_eq!(counts.total(), 3);

        let failed = ledger.list(JobState::Failed, 0, 10).await.unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("encoder exited"));
        assert_eq!(ledger.list(JobState::Pending, 1, 10).await.unwrap().len(), 1);
        assert!(ledger.list(JobState::Pending, 0, 0).await.unwrap().is_empty());
    }
}
