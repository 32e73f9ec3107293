use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::settings::WorkerSettings;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::media::publisher::ArtifactPublisher;
use crate::media::transcoder::{HlsTranscoder, TranscodeError, TranscodeProgress};
use crate::modules::lecture::repository::{LectureGateway, truncate_error};
use crate::queue::job::elapsed_since;
use crate::queue::{Claim, JobLedger, JobState, TRANSCODE_QUEUE, TranscodeJob, TranscodeMessage};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// What to tell the broker about a delivery once the worker is done with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Put back on the queue for this or another worker.
    Requeue,
    /// Drop without redelivery.
    Reject,
}

/// Which pipeline stage a job failed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Lecture,
    Transcode,
    Publish,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Lecture => "lecture",
            Stage::Transcode => "transcode",
            Stage::Publish => "publish",
        }
    }
}

fn log_transition(job: &TranscodeJob, from: JobState, to: JobState, since: OffsetDateTime) {
    info!(
        job_id = %job.job_id,
        lecture_id = %job.lecture_id,
        from = %from,
        to = %to,
        elapsed_ms = elapsed_since(since).as_millis() as u64,
        "Job state changed"
    );
}

/// Consumes transcode messages one at a time and drives each job through
/// transcode, publish and lecture update.
pub struct TranscodeWorker {
    ledger: Arc<dyn JobLedger>,
    lectures: Arc<dyn LectureGateway>,
    transcoder: HlsTranscoder,
    publisher: ArtifactPublisher,
    settings: WorkerSettings,
}

impl TranscodeWorker {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        lectures: Arc<dyn LectureGateway>,
        transcoder: HlsTranscoder,
        publisher: ArtifactPublisher,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            ledger,
            lectures,
            transcoder,
            publisher,
            settings,
        }
    }

    /// Runs until `shutdown` fires. A job in flight at shutdown is released
    /// back to `pending` and its message requeued.
    pub async fn run(&self, rabbit: RabbitMqService, shutdown: CancellationToken) {
        info!("🎥 Starting transcoder worker '{}'", self.settings.worker_id);
        self.recover_expired().await;

        while !shutdown.is_cancelled() {
            match rabbit.consume(TRANSCODE_QUEUE, &self.settings.worker_id, 1).await {
                Ok(consumer) => self.consume(consumer, &shutdown).await,
                Err(e) => error!("Failed to start consumer: {}", e),
            }

            if shutdown.is_cancelled() {
                break;
            }
            warn!("Consumer stopped, resubscribing in {}s", RESUBSCRIBE_DELAY.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }

        info!("🎥 Transcoder worker '{}' stopped", self.settings.worker_id);
    }

    async fn consume(&self, mut consumer: lapin::Consumer, shutdown: &CancellationToken) {
        info!("🎥 Transcoder worker listening on '{}'", TRANSCODE_QUEUE);

        let mut reaper = tokio::time::interval(self.settings.lease);
        reaper.tick().await;

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = reaper.tick() => {
                    self.recover_expired().await;
                    continue;
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!("Consumer error: {}", e);
                        return;
                    }
                    None => return,
                },
            };

            let disposition = self.handle(&delivery.data, shutdown).await;
            settle(&delivery, disposition).await;
        }
    }

    /// Moves jobs of crashed workers back to `pending`.
    pub async fn recover_expired(&self) {
        match self.ledger.requeue_expired().await {
            Ok(expired) => {
                for job in expired {
                    warn!(
                        job_id = %job.job_id,
                        lecture_id = %job.lecture_id,
                        from = %JobState::Active,
                        to = %JobState::Pending,
                        elapsed_ms = elapsed_since(job.active_since).as_millis() as u64,
                        "Lease expired, job requeued"
                    );
                }
            }
            Err(e) => warn!("Failed to requeue expired jobs: {}", e),
        }
    }

    /// Processes one queue message and decides how it is settled.
    pub async fn handle(&self, payload: &[u8], shutdown: &CancellationToken) -> Disposition {
        let message: TranscodeMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                error!("❌ Rejecting unparseable transcode message: {}", e);
                return Disposition::Reject;
            }
        };
        debug!(job_id = %message.job_id, lecture_id = %message.lecture_id, "📦 Received transcoding job");

        match self.claim(&message).await {
            Ok(Claim::Claimed { job, previous, previous_since }) => {
                log_transition(&job, previous, JobState::Active, previous_since);
                self.run_claimed(job, shutdown).await
            }
            Ok(Claim::Busy { lease_owner }) => {
                info!(
                    job_id = %message.job_id,
                    owner = lease_owner.as_deref().unwrap_or("unknown"),
                    "Job is leased by another worker, requeueing"
                );
                self.pause(shutdown).await;
                Disposition::Requeue
            }
            Ok(Claim::Finished(state)) => {
                info!(job_id = %message.job_id, state = %state, "Duplicate delivery of a finished job, skipping");
                Disposition::Ack
            }
            Ok(Claim::Missing) => {
                error!(job_id = %message.job_id, "Job vanished from the ledger while claiming");
                Disposition::Reject
            }
            Err(e) => {
                error!(job_id = %message.job_id, "Job ledger unavailable: {}", e);
                self.pause(shutdown).await;
                Disposition::Requeue
            }
        }
    }

    async fn claim(&self, message: &TranscodeMessage) -> crate::queue::QueueResult<Claim> {
        let worker_id = &self.settings.worker_id;
        match self.ledger.claim(message.job_id, worker_id, self.settings.lease).await? {
            Claim::Missing => {
                warn!(job_id = %message.job_id, "Job missing from the ledger, recreating it from the message");
                self.ledger.create(&TranscodeJob::from_message(message.clone())).await?;
                self.ledger.claim(message.job_id, worker_id, self.settings.lease).await
            }
            claim => Ok(claim),
        }
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.settings.busy_requeue_delay) => {}
        }
    }

    /// Runs the pipeline while a heartbeat keeps the lease alive. Losing the
    /// lease cancels the job the same way shutdown does.
    async fn run_claimed(&self, job: TranscodeJob, shutdown: &CancellationToken) -> Disposition {
        let cancel = shutdown.child_token();
        let done = CancellationToken::new();

        let pipeline = async {
            let disposition = self.process(&job, &cancel).await;
            done.cancel();
            disposition
        };
        let (disposition, ()) = tokio::join!(pipeline, self.heartbeat(&job, &done, &cancel));
        disposition
    }

    async fn heartbeat(&self, job: &TranscodeJob, done: &CancellationToken, cancel: &CancellationToken) {
        let period = (self.settings.lease / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = ticker.tick() => {
                    match self.ledger.renew(job.job_id, &self.settings.worker_id, self.settings.lease).await {
                        Ok(true) => debug!(job_id = %job.job_id, "Lease renewed"),
                        Ok(false) => {
                            warn!(job_id = %job.job_id, "Lease lost to another worker, abandoning job");
                            cancel.cancel();
                            return;
                        }
                        Err(e) => warn!(job_id = %job.job_id, "Failed to renew lease: {}", e),
                    }
                }
            }
        }
    }

    async fn process(&self, job: &TranscodeJob, cancel: &CancellationToken) -> Disposition {
        let started = Instant::now();
        let work_dir = self.settings.work_dir.join(job.job_id.to_string());

        // 1. Lecture -> processing
        match self.lectures.set_processing(job.lecture_id, job.job_id).await {
            Ok(true) => {}
            Ok(false) => return self.supersede(job, &work_dir, false).await,
            Err(e) => {
                return match self.lectures.exists(job.lecture_id).await {
                    Ok(false) => {
                        self.fail(job, &work_dir, Stage::Lecture, format!("lecture no longer exists: {}", e))
                            .await
                    }
                    _ => {
                        error!(job_id = %job.job_id, lecture_id = %job.lecture_id, "Failed to mark lecture processing: {}", e);
                        self.interrupt(job, &work_dir).await;
                        self.pause(cancel).await;
                        Disposition::Requeue
                    }
                };
            }
        }

        // 2. Transcode
        let (progress_tx, progress_rx) = watch::channel(TranscodeProgress::default());
        let transcode = async {
            let result = self
                .transcoder
                .transcode(&job.source_path, &work_dir, self.transcoder.renditions(), cancel, Some(&progress_tx))
                .await;
            drop(progress_tx);
            result
        };
        let (transcoded, ()) = tokio::join!(transcode, log_progress(job, progress_rx));

        let artifacts = match transcoded {
            Ok(artifacts) => artifacts,
            Err(TranscodeError::Cancelled) => {
                self.interrupt(job, &work_dir).await;
                return Disposition::Requeue;
            }
            Err(e) => return self.fail(job, &work_dir, Stage::Transcode, e.to_string()).await,
        };
        for rendition in &artifacts.renditions {
            debug!(
                job_id = %job.job_id,
                rendition = %rendition.label,
                playlist = %rendition.playlist.display(),
                segments = rendition.segments,
                "Rendition ready"
            );
        }
        info!(
            job_id = %job.job_id,
            master = %artifacts.master_playlist.display(),
            renditions = artifacts.renditions.len(),
            "Transcode finished"
        );

        // 3. Publish
        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.publisher.publish(&artifacts.root, &job.video_name) => Some(result),
        };
        let video_link = match published {
            None => {
                self.interrupt(job, &work_dir).await;
                return Disposition::Requeue;
            }
            Some(Ok(url)) => url,
            Some(Err(e)) => return self.fail(job, &work_dir, Stage::Publish, e.to_string()).await,
        };

        // 4. Lecture -> completed
        match self.lectures.set_completed(job.lecture_id, job.job_id, &video_link).await {
            Ok(true) => {}
            Ok(false) => return self.supersede(job, &work_dir, true).await,
            Err(e) => {
                return self
                    .fail(job, &work_dir, Stage::Publish, format!("failed to record video link: {}", e))
                    .await;
            }
        }

        self.finish(job, &work_dir, None, false).await;

        info!(
            job_id = %job.job_id,
            lecture_id = %job.lecture_id,
            video_link = %video_link,
            took_ms = started.elapsed().as_millis() as u64,
            "✅ Job completed"
        );
        Disposition::Ack
    }

    /// Terminal failure: record the reason on the lecture, clean up, no retry.
    async fn fail(&self, job: &TranscodeJob, work_dir: &Path, stage: Stage, reason: String) -> Disposition {
        error!(
            job_id = %job.job_id,
            lecture_id = %job.lecture_id,
            stage = stage.as_str(),
            "❌ Job failed: {}",
            reason
        );

        if stage == Stage::Publish {
            match self.publisher.remove(&job.video_name).await {
                Ok(removed) => info!(job_id = %job.job_id, removed, "Removed partial upload"),
                Err(e) => warn!(job_id = %job.job_id, "Failed to remove partial upload: {}", e),
            }
        }

        match self.lectures.set_failed(job.lecture_id, job.job_id, &reason).await {
            Ok(true) => {}
            Ok(false) => info!(
                job_id = %job.job_id,
                lecture_id = %job.lecture_id,
                "Lecture was re-uploaded meanwhile, leaving its status untouched"
            ),
            Err(e) => error!(job_id = %job.job_id, lecture_id = %job.lecture_id, "Failed to mark lecture failed: {}", e),
        }

        self.finish(job, work_dir, Some(&reason), self.settings.keep_failed_artifacts)
            .await;
        Disposition::Ack
    }

    /// The lecture points at a newer upload: this job's result is dropped
    /// without touching the lecture.
    async fn supersede(&self, job: &TranscodeJob, work_dir: &Path, published: bool) -> Disposition {
        info!(
            job_id = %job.job_id,
            lecture_id = %job.lecture_id,
            "Lecture was re-uploaded, discarding this job"
        );

        if published {
            match self.publisher.remove(&job.video_name).await {
                Ok(removed) => info!(job_id = %job.job_id, removed, "Removed superseded upload"),
                Err(e) => warn!(job_id = %job.job_id, "Failed to remove superseded upload: {}", e),
            }
        }

        self.finish(job, work_dir, Some("superseded by a newer upload"), false)
            .await;
        Disposition::Ack
    }

    /// Records the outcome in the ledger, then deletes the local files. When
    /// the lease went to another worker the files are left to that worker.
    async fn finish(&self, job: &TranscodeJob, work_dir: &Path, failure: Option<&str>, keep_local: bool) {
        let worker_id = &self.settings.worker_id;
        let (target, recorded) = match failure {
            None => (JobState::Completed, self.ledger.complete(job.job_id, worker_id).await),
            Some(reason) => (
                JobState::Failed,
                self.ledger.fail(job.job_id, worker_id, &truncate_error(reason)).await,
            ),
        };

        match recorded {
            Ok(true) => log_transition(job, JobState::Active, target, job.state_changed_at),
            Ok(false) => {
                warn!(
                    job_id = %job.job_id,
                    to = %target,
                    "Lease lost before the job could be finished, keeping local files for the new owner"
                );
                return;
            }
            Err(e) => error!(job_id = %job.job_id, to = %target, "Failed to record job outcome: {}", e),
        }

        if keep_local {
            warn!(
                job_id = %job.job_id,
                source = %job.source_path.display(),
                work_dir = %work_dir.display(),
                "Keeping failed job artifacts"
            );
        } else {
            self.remove_local(job, work_dir).await;
        }
    }

    /// Gives an unfinished job back. The staged input is kept for the retry.
    async fn interrupt(&self, job: &TranscodeJob, work_dir: &Path) {
        remove_path(work_dir, false).await;

        match self.ledger.release(job.job_id, &self.settings.worker_id).await {
            Ok(true) => log_transition(job, JobState::Active, JobState::Pending, job.state_changed_at),
            Ok(false) => debug!(job_id = %job.job_id, "Job already taken over, nothing to release"),
            Err(e) => warn!(job_id = %job.job_id, "Failed to release job: {}", e),
        }
    }

    /// Deletes the staged input (its per-job staging dir when it has one) and
    /// the local rendition tree.
    async fn remove_local(&self, job: &TranscodeJob, work_dir: &Path) {
        remove_path(&staged_input_root(job, &self.settings.staging_dir), true).await;
        remove_path(work_dir, true).await;
    }
}

/// `<staging>/<job_id>/` when the input lives there, otherwise the file itself.
fn staged_input_root(job: &TranscodeJob, staging_dir: &Path) -> PathBuf {
    let job_dir = staging_dir.join(job.job_id.to_string());
    if job.source_path.parent() == Some(job_dir.as_path()) {
        job_dir
    } else {
        job.source_path.clone()
    }
}

async fn remove_path(path: &Path, announce: bool) {
    let removed = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };

    match removed {
        Ok(()) if announce => warn!("🗑️ Deleted {}", path.display()),
        Ok(()) => {}
        Err(e) => error!("Failed to delete {}: {}", path.display(), e),
    }
}

async fn log_progress(job: &TranscodeJob, mut progress: watch::Receiver<TranscodeProgress>) {
    let mut current = String::new();
    while progress.changed().await.is_ok() {
        let snapshot = progress.borrow_and_update().clone();
        if snapshot.rendition != current && !snapshot.rendition.is_empty() {
            info!(
                job_id = %job.job_id,
                rendition = %snapshot.rendition,
                step = snapshot.completed_renditions + 1,
                of = snapshot.total_renditions,
                "Encoding rendition"
            );
            current = snapshot.rendition;
        } else {
            debug!(job_id = %job.job_id, out_time_ms = snapshot.out_time_ms, "Encoder progress");
        }
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition) {
    let settled = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await.map(|_| ()),
        Disposition::Requeue => delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ()),
        Disposition::Reject => delivery
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ()),
    };

    if let Err(e) = settled {
        error!("Failed to settle message ({:?}): {}", disposition, e);
    }
}
