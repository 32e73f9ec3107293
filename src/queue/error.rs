use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    Broker(String),

    #[error("job ledger unavailable: {0}")]
    Ledger(#[from] redis::RedisError),

    #[error("corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;
