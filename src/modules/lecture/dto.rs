use serde::Serialize;
use uuid::Uuid;

use super::model::{LectureProcessing, ProcessingStatus};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAcceptedResponse {
    pub lecture_id: Uuid,
    pub job_id: Uuid,
    pub processing_status: ProcessingStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResponse {
    pub lecture_id: Uuid,
    pub processing_status: Option<ProcessingStatus>,
    pub job_id: Option<String>,
    pub video_link: Option<String>,
    pub processing_error: Option<String>,
}

impl From<LectureProcessing> for ProcessingResponse {
    fn from(row: LectureProcessing) -> Self {
        Self {
            lecture_id: row.id,
            processing_status: row.status(),
            job_id: row.job_id,
            video_link: row.video_link,
            processing_error: row.processing_error,
        }
    }
}
