use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [JobState::Pending, JobState::Active, JobState::Completed, JobState::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// Body of the broker message, as published by ingress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeMessage {
    pub job_id: Uuid,
    pub lecture_id: Uuid,
    pub source_path: PathBuf,
    pub video_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub job_id: Uuid,
    pub lecture_id: Uuid,
    pub source_path: PathBuf,
    pub video_name: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub state_changed_at: OffsetDateTime,
    pub lease_owner: Option<String>,
    #[serde(with = "time::serde::timestamp::option")]
    pub lease_expires_at: Option<OffsetDateTime>,
}

impl TranscodeJob {
    #[cfg(test)]
    pub fn new(lecture_id: Uuid, source_path: PathBuf, video_name: String) -> Self {
        Self::from_message(TranscodeMessage {
            job_id: Uuid::new_v4(),
            lecture_id,
            source_path,
            video_name,
        })
    }

    /// Fresh `pending` record for a message, e.g. when the ledger lost it.
    pub fn from_message(message: TranscodeMessage) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            job_id: message.job_id,
            lecture_id: message.lecture_id,
            source_path: message.source_path,
            video_name: message.video_name,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            state_changed_at: now,
            lease_owner: None,
            lease_expires_at: None,
        }
    }
}

/// Number of jobs per state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.completed + self.failed
    }
}

/// Result of trying to take ownership of a job.
#[derive(Clone, Debug)]
pub enum Claim {
    /// Now `active` and leased to the caller. `previous` is the state it left,
    /// `active` when an expired lease of a dead worker was taken over.
    Claimed {
        job: TranscodeJob,
        previous: JobState,
        previous_since: OffsetDateTime,
    },
    /// Another worker holds a live lease.
    Busy { lease_owner: Option<String> },
    /// Already `completed` or `failed`.
    Finished(JobState),
    Missing,
}

/// An `active` job whose lease lapsed and that went back to `pending`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiredJob {
    pub job_id: Uuid,
    pub lecture_id: Uuid,
    /// When the dead worker had claimed it.
    pub active_since: OffsetDateTime,
}

pub fn elapsed_since(since: OffsetDateTime) -> Duration {
    let elapsed = OffsetDateTime::now_utc() - since;
    Duration::try_from(elapsed).unwrap_or_default()
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
