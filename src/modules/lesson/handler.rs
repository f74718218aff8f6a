use super::dto::{DispatchResponse, LessonVideoResponse};
use super::service::LessonService;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// Queue a lesson's upload for HLS packaging
#[utoipa::path(
    post,
    path = "/api/v1/lessons/{id}/process",
    params(
        ("id" = i64, Path, description = "Lesson ID")
    ),
    responses(
        (status = 202, description = "Job queued", body = ApiResponse<DispatchResponse>),
        (status = 404, description = "Lesson not found"),
        (status = 409, description = "Lesson is already published or being processed")
    ),
    tag = "Lessons"
)]
pub async fn process_video(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match LessonService::dispatch(state, id).await {
        Ok(job) => ApiSuccess(
            ApiResponse::success(job, "Video processing queued"),
            StatusCode::ACCEPTED,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Get a lesson's video status
#[utoipa::path(
    get,
    path = "/api/v1/lessons/{id}/video",
    params(
        ("id" = i64, Path, description = "Lesson ID")
    ),
    responses(
        (status = 200, description = "Video status", body = ApiResponse<LessonVideoResponse>),
        (status = 404, description = "Lesson not found")
    ),
    tag = "Lessons"
)]
pub async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match LessonService::video_status(state, id).await {
        Ok(video) => ApiSuccess(
            ApiResponse::success(video, "Video status retrieved successfully"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}
