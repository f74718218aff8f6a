use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::modules::lesson::model::Lesson;
use crate::transcode::status::VideoStatus;

#[derive(Debug, Serialize, ToSchema)]
pub struct DispatchResponse {
    pub job_id: Uuid,
    pub lesson_id: i64,
    pub queue: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LessonVideoResponse {
    pub id: i64,
    pub video_status: VideoStatus,
    pub video_path: Option<String>,
    /// Seconds, rounded.
    pub video_duration: Option<i64>,
    /// Bytes of the original upload.
    pub video_size: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub processing_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl From<Lesson> for LessonVideoResponse {
    fn from(l: Lesson) -> Self {
        Self {
            id: l.id,
            video_status: l.status(),
            video_path: l.video_path,
            video_duration: l.video_duration,
            video_size: l.video_size,
            processing_started_at: l.processing_started_at,
            updated_at: l.updated_at,
        }
    }
}
