use crate::modules::lecture::service::LectureService;
use crate::queue::TranscodeQueue;

#[derive(Clone)]
pub struct AppState {
    pub lectures: LectureService,
    pub queue: TranscodeQueue,
}

impl AppState {
    pub fn new(lectures: LectureService, queue: TranscodeQueue) -> Self {
        Self { lectures, queue }
    }
}
