use axum::Router;
use axum::routing::get;
use crate::state::AppState;

pub mod dto;
pub mod handler;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(handler::list_jobs))
        .route("/jobs/stats", get(handler::job_stats))
        .route("/jobs/{id}", get(handler::get_job))
}
