use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Video status of a lesson as persisted in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }

    /// Apply a lifecycle event. Status only moves forward: a retry may take
    /// `failed` back to `processing`, but `ready` is never left.
    pub fn transition(self, event: StatusEvent) -> Result<VideoStatus, InvalidTransition> {
        use VideoStatus::*;

        match (self, event) {
            (Pending | Failed | Processing, StatusEvent::AttemptStarted) => Ok(Processing),
            (Processing, StatusEvent::AttemptSucceeded) => Ok(Ready),
            (Pending | Processing | Failed, StatusEvent::AttemptFailed) => Ok(Failed),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for VideoStatus {
    fn from(s: &str) -> Self {
        match s {
            "processing" => VideoStatus::Processing,
            "ready" => VideoStatus::Ready,
            "failed" => VideoStatus::Failed,
            _ => VideoStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    AttemptStarted,
    AttemptSucceeded,
    AttemptFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply {event:?} to a lesson in status {from}")]
pub struct InvalidTransition {
    pub from: VideoStatus,
    pub event: StatusEvent,
}
