pub mod jobs;
pub mod lecture;
