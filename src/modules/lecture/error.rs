use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use uuid::Uuid;

use crate::common::response::ApiError;
use crate::common::upload::StagingError;
use crate::queue::QueueError;

/// Upload rejected before anything was enqueued.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("multipart field 'video' is missing")]
    MissingFile,

    #[error("unsupported video type '{0}'")]
    UnsupportedType(String),

    #[error("uploaded file is empty")]
    Empty,

    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("malformed multipart body: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("lecture {0} not found")]
    LectureNotFound(Uuid),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("transcode queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StagingError> for UploadError {
    fn from(e: StagingError) -> Self {
        match e {
            StagingError::TooLarge { limit } => InputError::TooLarge { limit }.into(),
            StagingError::Empty => InputError::Empty.into(),
            StagingError::Interrupted(reason) => InputError::Malformed(reason).into(),
            StagingError::Io(e) => UploadError::Internal(e.into()),
        }
    }
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::LectureNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::Input(InputError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Input(_) => StatusCode::BAD_REQUEST,
            UploadError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        ApiError(self.to_string(), self.status()).into_response()
    }
}
