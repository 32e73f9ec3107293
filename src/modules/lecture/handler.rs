use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, warn};
use uuid::Uuid;

/// Accepts a lecture video for HLS processing. Returns as soon as the file is
/// staged and the job is queued.
pub async fn upload_lecture_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> impl IntoResponse {
    match state.lectures.accept_upload(id, multipart).await {
        Ok(res) => ApiSuccess(
            ApiResponse::success(res, "Video accepted for processing"),
            StatusCode::ACCEPTED,
        )
        .into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                error!(lecture_id = %id, "Upload failed: {}", e);
            } else {
                warn!(lecture_id = %id, "Upload rejected: {}", e);
            }
            e.into_response()
        }
    }
}

pub async fn get_lecture_processing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.lectures.processing(id).await {
        Ok(Some(res)) => ApiSuccess(ApiResponse::success(res, "Processing status retrieved"), StatusCode::OK).into_response(),
        Ok(None) => ApiError("Lecture not found".to_string(), StatusCode::NOT_FOUND).into_response(),
        Err(e) => ApiError(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
