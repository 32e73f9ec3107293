use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::Multipart;
use mime::Mime;
use tracing::{info, warn};
use uuid::Uuid;

use super::dto::{ProcessingResponse, UploadAcceptedResponse};
use super::error::{InputError, UploadError};
use super::model::ProcessingStatus;
use super::repository::LectureGateway;
use crate::common::{slug, upload};
use crate::queue::{TranscodeMessage, TranscodeQueue};

const VIDEO_FIELD: &str = "video";
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "avi", "m4v"];
const FALLBACK_EXTENSION: &str = "mp4";

/// Picks the staging extension for an upload, or rejects it. The file name's
/// extension wins when it is a known container; a file without one is taken
/// when the client declared a `video/*` type.
pub fn video_extension(file_name: &str, declared: Option<&str>) -> Result<String, InputError> {
    let declared: Option<Mime> = declared.and_then(|raw| raw.parse().ok());
    if let Some(declared) = &declared {
        let generic = *declared == mime::APPLICATION_OCTET_STREAM;
        if declared.type_() != mime::VIDEO && !generic {
            return Err(InputError::UnsupportedType(declared.essence_str().to_string()));
        }
    }

    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if let Some(ext) = &extension {
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(ext.clone());
        }
    }

    match declared {
        Some(declared) if declared.type_() == mime::VIDEO => {
            let known = mime_guess::get_mime_extensions(&declared)
                .and_then(|exts| exts.iter().find(|e| VIDEO_EXTENSIONS.contains(*e)))
                .copied()
                .unwrap_or(FALLBACK_EXTENSION);
            Ok(known.to_string())
        }
        _ => {
            let guessed = mime_guess::from_path(file_name)
                .first()
                .map(|m| m.essence_str().to_string())
                .unwrap_or_else(|| extension.unwrap_or_else(|| "unknown".to_string()));
            Err(InputError::UnsupportedType(guessed))
        }
    }
}

/// Ingress side of the pipeline: stages an uploaded video and hands it to the
/// transcode queue.
#[derive(Clone)]
pub struct LectureService {
    lectures: Arc<dyn LectureGateway>,
    queue: TranscodeQueue,
    staging_dir: PathBuf,
    max_upload_bytes: u64,
}

impl LectureService {
    pub fn new(
        lectures: Arc<dyn LectureGateway>,
        queue: TranscodeQueue,
        staging_dir: PathBuf,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            lectures,
            queue,
            staging_dir,
            max_upload_bytes,
        }
    }

    pub async fn processing(&self, lecture_id: Uuid) -> anyhow::Result<Option<ProcessingResponse>> {
        let row = self.lectures.processing(lecture_id).await?;
        Ok(row.map(ProcessingResponse::from))
    }

    pub async fn accept_upload(
        &self,
        lecture_id: Uuid,
        mut multipart: Multipart,
    ) -> Result<UploadAcceptedResponse, UploadError> {
        if !self.lectures.exists(lecture_id).await? {
            return Err(UploadError::LectureNotFound(lecture_id));
        }

        let job_id = Uuid::new_v4();
        let job_dir = self.staging_dir.join(job_id.to_string());

        let (source_path, original_name) = loop {
            let field = multipart
                .next_field()
                .await
                .map_err(|e| InputError::Malformed(e.body_text()))?
                .ok_or(InputError::MissingFile)?;

            if field.name() != Some(VIDEO_FIELD) {
                continue;
            }

            let original_name = field.file_name().unwrap_or("video.mp4").to_string();
            let extension = video_extension(&original_name, field.content_type())?;
            let source_path = job_dir.join(format!("source.{}", extension));

            info!(lecture_id = %lecture_id, job_id = %job_id, file = %original_name, "Staging lecture video");

            if let Err(e) = upload::stage_field(field, &source_path, self.max_upload_bytes).await {
                remove_staging(&job_dir).await;
                return Err(e.into());
            }
            break (source_path, original_name);
        };

        let message = TranscodeMessage {
            job_id,
            lecture_id,
            source_path,
            video_name: slug::video_name(&original_name),
        };

        // Pending is recorded first so a fast worker's `processing` is never overwritten.
        if let Err(e) = self.lectures.set_pending(lecture_id, job_id).await {
            remove_staging(&job_dir).await;
            return Err(e.into());
        }

        if let Err(e) = self.queue.enqueue(message).await {
            remove_staging(&job_dir).await;
            if let Err(record) = self.lectures.set_failed(lecture_id, job_id, &e.to_string()).await {
                warn!(lecture_id = %lecture_id, "Failed to record enqueue failure: {}", record);
            }
            return Err(e.into());
        }

        Ok(UploadAcceptedResponse {
            lecture_id,
            job_id,
            processing_status: ProcessingStatus::Pending,
        })
    }
}

async fn remove_staging(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staging dir {}: {}", dir.display(), e);
        }
    }
}
