use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::modules::jobs::dto::{JobListQuery, JobStatsResponse};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

pub async fn job_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.counts().await {
        Ok(counts) => ApiSuccess(
            ApiResponse::success(JobStatsResponse::from(counts), "Job counts retrieved"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => {
            error!("Failed to count jobs: {}", e);
            ApiError(e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> impl IntoResponse {
    let job_state = match query.state() {
        Ok(s) => s,
        Err(e) => return ApiError(e, StatusCode::BAD_REQUEST).into_response(),
    };
    let (offset, limit) = query.window();

    match state.queue.list(job_state, offset, limit).await {
        Ok(jobs) => ApiSuccess(ApiResponse::success(jobs, "Jobs retrieved"), StatusCode::OK).into_response(),
        Err(e) => {
            error!("Failed to list {} jobs: {}", job_state, e);
            ApiError(e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.queue.get(id).await {
        Ok(Some(job)) => ApiSuccess(ApiResponse::success(job, "Job retrieved"), StatusCode::OK).into_response(),
        Ok(None) => ApiError("Job not found".to_string(), StatusCode::NOT_FOUND).into_response(),
        Err(e) => ApiError(e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response(),
    }
}
