use anyhow::{Result, anyhow};
use async_trait::async_trait;
use time::OffsetDateTime;

use super::model::Lesson;
use crate::infrastructure::db::pool::DbPool;
use crate::transcode::probe::ProcessingMetadata;
use crate::transcode::status::VideoStatus;

const LESSON_COLUMNS: &str =
    "id, video_path, video_status, video_duration, video_size, processing_started_at, updated_at";

/// Record store used by the transcode pipeline. Each method is a single
/// atomic update.
#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Lesson>>;

    /// Set status `processing` together with the attempt start time.
    async fn mark_processing(&self, id: i64, started_at: OffsetDateTime) -> Result<()>;

    async fn update_status(&self, id: i64, status: VideoStatus) -> Result<()>;

    /// Set status `ready` together with the derived metadata.
    async fn mark_ready(&self, id: i64, metadata: &ProcessingMetadata) -> Result<()>;

    async fn update_video_path(&self, id: i64, video_path: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct LessonRepository {
    pool: DbPool,
}

impl LessonRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn ensure_updated(id: i64, rows: u64) -> Result<()> {
    if rows == 0 {
        return Err(anyhow!("Lesson {} not found", id));
    }
    Ok(())
}

#[async_trait]
impl LessonStore for LessonRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<Lesson>> {
        let lesson = sqlx::query_as::<_, Lesson>(&format!(
            "SELECT {LESSON_COLUMNS} FROM lessons WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(lesson)
    }

    async fn mark_processing(&self, id: i64, started_at: OffsetDateTime) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE lessons
            SET video_status = $1, processing_started_at = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(VideoStatus::Processing.as_str())
        .bind(started_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to mark lesson {} as processing: {}", id, e))?;

        ensure_updated(id, result.rows_affected())
    }

    async fn update_status(&self, id: i64, status: VideoStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE lessons SET video_status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to update status of lesson {}: {}", id, e))?;

        ensure_updated(id, result.rows_affected())
    }

    async fn mark_ready(&self, id: i64, metadata: &ProcessingMetadata) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE lessons
            SET video_status = $1, video_duration = $2, video_size = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(VideoStatus::Ready.as_str())
        .bind(metadata.duration_secs)
        .bind(metadata.size_bytes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to mark lesson {} as ready: {}", id, e))?;

        ensure_updated(id, result.rows_affected())
    }

    async fn update_video_path(&self, id: i64, video_path: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE lessons SET video_path = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(video_path)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to update video path of lesson {}: {}", id, e))?;

        ensure_updated(id, result.rows_affected())
    }
}
