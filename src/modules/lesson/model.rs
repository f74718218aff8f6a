use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::transcode::status::VideoStatus;

#[derive(Debug, Serialize, Deserialize, FromRow, Clone, ToSchema)]
pub struct Lesson {
    pub id: i64,
    /// Relative to the storage root. Points at the upload until publication,
    /// then at the HLS playlist.
    pub video_path: Option<String>,
    pub video_status: String, // Stored as string in DB
    pub video_duration: Option<i64>,
    pub video_size: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub processing_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl Lesson {
    pub fn status(&self) -> VideoStatus {
        VideoStatus::from(self.video_status.as_str())
    }
}
