use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Message on the video-processing queue. Only the lesson id travels; every
/// attempt re-reads the lesson from the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub job_id: Uuid,
    pub lesson_id: i64,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    #[serde(with = "time::serde::timestamp")]
    pub first_dispatched_at: OffsetDateTime,
}

impl TranscodeJob {
    pub fn new(lesson_id: i64) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            lesson_id,
            attempt: 1,
            first_dispatched_at: OffsetDateTime::now_utc(),
        }
    }

    /// The same job, scheduled for its next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}
