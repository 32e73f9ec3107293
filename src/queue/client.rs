use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use super::error::{QueueError, QueueResult};
use super::job::{JobState, StateCounts, TranscodeJob, TranscodeMessage};
use super::ledger::JobLedger;
use super::redis_ledger::RedisJobLedger;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::redis::client::RedisService;

/// Durable broker queue carrying transcode messages.
pub const TRANSCODE_QUEUE: &str = "transcoding_tasks";

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, payload: &[u8]) -> anyhow::Result<()>;

    async fn close(&self) {}
}

/// Producer side of the transcode queue plus read access to the ledger.
/// Built once at startup from explicit connections and passed by handle.
#[derive(Clone)]
pub struct TranscodeQueue {
    ledger: Arc<dyn JobLedger>,
    broker: Arc<dyn Broker>,
}

impl TranscodeQueue {
    pub fn new(ledger: Arc<dyn JobLedger>, broker: Arc<dyn Broker>) -> Self {
        Self { ledger, broker }
    }

    /// Connects the Redis ledger and the RabbitMQ producer.
    pub async fn open(redis_url: &str, rabbitmq_url: &str) -> QueueResult<Self> {
        let redis = RedisService::new(redis_url).await?;
        let rabbit = RabbitMqService::new(rabbitmq_url)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        Ok(Self::new(Arc::new(RedisJobLedger::new(redis)), Arc::new(rabbit)))
    }

    pub async fn close(&self) {
        self.broker.close().await;
    }

    pub fn ledger(&self) -> Arc<dyn JobLedger> {
        self.ledger.clone()
    }

    /// Records a `pending` job and publishes its message. A job whose message
    /// could not be published is removed again, so the ledger never holds a
    /// job no worker will see.
    pub async fn enqueue(&self, message: TranscodeMessage) -> QueueResult<TranscodeJob> {
        let payload = serde_json::to_vec(&message)?;
        let job = TranscodeJob::from_message(message);
        let lecture_id = job.lecture_id;

        self.ledger.create(&job).await?;

        if let Err(e) = self.broker.publish(TRANSCODE_QUEUE, &payload).await {
            error!(job_id = %job.job_id, lecture_id = %lecture_id, "Failed to publish transcode job: {}", e);
            if let Err(cleanup) = self.ledger.remove(job.job_id).await {
                error!(job_id = %job.job_id, "Failed to remove unpublished job: {}", cleanup);
            }
            return Err(QueueError::Broker(e.to_string()));
        }

        info!(job_id = %job.job_id, lecture_id = %lecture_id, video_name = %job.video_name, "Transcode job enqueued");
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> QueueResult<Option<TranscodeJob>> {
        self.ledger.get(job_id).await
    }

    pub async fn counts(&self) -> QueueResult<StateCounts> {
        self.ledger.counts().await
    }

    pub async fn list(&self, state: JobState, offset: usize, limit: usize) -> QueueResult<Vec<TranscodeJob>> {
        self.ledger.list(state, offset, limit).await
    }
}
