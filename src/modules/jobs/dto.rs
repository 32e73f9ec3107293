use serde::{Deserialize, Serialize};

use crate::queue::{JobState, StateCounts};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 200;
pub const MAX_OFFSET: usize = i32::MAX as usize;

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub state: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl JobListQuery {
    pub fn state(&self) -> Result<JobState, String> {
        match &self.state {
            Some(raw) => raw.to_ascii_lowercase().parse(),
            None => Ok(JobState::Pending),
        }
    }

    /// `(offset, limit)` with the limit capped and the offset kept within
    /// what a sorted-set index can address.
    pub fn window(&self) -> (usize, usize) {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).min(MAX_OFFSET);
        (offset, limit)
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatsResponse {
    #[serde(flatten)]
    pub counts: StateCounts,
    pub total: usize,
}

impl From<StateCounts> for JobStatsResponse {
    fn from(counts: StateCounts) -> Self {
        let total = counts.total();
        Self { counts, total }
    }
}
