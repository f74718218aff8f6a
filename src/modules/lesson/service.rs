use axum::http::StatusCode;
use tracing::info;

use super::dto::{DispatchResponse, LessonVideoResponse};
use super::events::TranscodeJob;
use super::model::Lesson;
use super::repository::{LessonRepository, LessonStore};
use crate::state::AppState;
use crate::transcode::status::VideoStatus;

#[derive(Debug, thiserror::Error)]
pub enum LessonError {
    #[error("Lesson {0} not found")]
    NotFound(i64),

    #[error("Lesson {0} is already published")]
    AlreadyPublished(i64),

    #[error("Lesson {0} is already being processed")]
    InProgress(i64),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LessonError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LessonError::NotFound(_) => StatusCode::NOT_FOUND,
            LessonError::AlreadyPublished(_) | LessonError::InProgress(_) => StatusCode::CONFLICT,
            LessonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Only `pending` and `failed` lessons can be queued.
fn ensure_dispatchable(id: i64, lesson: Option<Lesson>) -> Result<Lesson, LessonError> {
    let lesson = lesson.ok_or(LessonError::NotFound(id))?;
    match lesson.status() {
        VideoStatus::Ready => Err(LessonError::AlreadyPublished(id)),
        VideoStatus::Processing => Err(LessonError::InProgress(id)),
        VideoStatus::Pending | VideoStatus::Failed => Ok(lesson),
    }
}

async fn load_dispatchable(store: &dyn LessonStore, id: i64) -> Result<Lesson, LessonError> {
    ensure_dispatchable(id, store.find_by_id(id).await?)
}

pub struct LessonService;

impl LessonService {
    pub async fn dispatch(state: AppState, id: i64) -> Result<DispatchResponse, LessonError> {
        let repo = LessonRepository::new(state.db.clone());
        load_dispatchable(&repo, id).await?;

        let job = TranscodeJob::new(id);
        let payload = serde_json::to_vec(&job).map_err(anyhow::Error::from)?;
        let queue = state.config.transcode.queue.clone();
        state.queue.publish(&queue, &payload).await?;

        info!(lesson_id = id, job_id = %job.job_id, "📨 Lesson queued for video processing");

        Ok(DispatchResponse {
            job_id: job.job_id,
            lesson_id: id,
            queue,
        })
    }

    pub async fn video_status(state: AppState, id: i64) -> Result<LessonVideoResponse, LessonError> {
        let repo = LessonRepository::new(state.db.clone());
        let lesson = repo.find_by_id(id).await?.ok_or(LessonError::NotFound(id))?;
        Ok(LessonVideoResponse::from(lesson))
    }
}
