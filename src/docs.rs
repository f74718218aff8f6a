use utoipa::OpenApi;
use crate::modules::lesson::dto::*;
use crate::transcode::status::VideoStatus;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health,
        crate::modules::lesson::handler::process_video,
        crate::modules::lesson::handler::get_video,
    ),
    components(
        schemas(DispatchResponse, LessonVideoResponse, VideoStatus)
    ),
    tags(
        (name = "Lessons", description = "Lesson video processing"),
        (name = "System", description = "Operational endpoints")
    )
)]
pub struct ApiDoc;
