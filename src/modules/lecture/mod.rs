use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use crate::state::AppState;

pub mod dto;
pub mod error;
pub mod handler;
pub mod model;
pub mod repository;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/lectures/{id}/video",
            // Size is enforced while staging, against MAX_UPLOAD_BYTES
            post(handler::upload_lecture_video).layer(DefaultBodyLimit::disable()),
        )
        .route("/lectures/{id}/processing", get(handler::get_lecture_processing))
}
