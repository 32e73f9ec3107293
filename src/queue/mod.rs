pub mod client;
pub mod error;
pub mod job;
pub mod ledger;
#[cfg(test)]
pub mod memory;
pub mod redis_ledger;

pub use client::{Broker, TRANSCODE_QUEUE, TranscodeQueue};
pub use error::{QueueError, QueueResult};
pub use job::{Claim, ExpiredJob, JobState, StateCounts, TranscodeJob, TranscodeMessage};
pub use ledger::JobLedger;
pub use redis_ledger::RedisJobLedger;
