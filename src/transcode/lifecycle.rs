//! Transcode job lifecycle.
//!
//! One call to [`TranscodeController::run`] is one attempt. It walks the
//! lesson through
//!
//! ```text
//! start → validated → toolchain_checked → dirs_ready → processing → keyed
//!       → encoded → verified → introspected → published
//! ```
//!
//! and any failure lands in `failed`. Status is written to the record store
//! at `processing`, at `published` (as `ready`) and on failure, so after an
//! attempt returns the lesson is either `ready` or `failed`.
//!
//! Publication commits metadata before deleting the source. A crash between
//! the two leaves a `ready` lesson whose path still points at the upload;
//! the next delivery finishes the job instead of re-encoding.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use time::OffsetDateTime;
use tracing::{error, info, warn};

use super::command::CommandRunner;
use super::encoder::run_encoder;
use super::error::TranscodeError;
use super::keys::{KeyUriBuilder, provision_keys};
use super::probe::{ProcessingMetadata, introspect};
use super::request::{PLAYLIST_FILE, StorageLayout, TranscodeRequest};
use super::status::{StatusEvent, VideoStatus};
use super::toolchain::check_encoder;
use super::validator::{format_bytes, validate_source};
use super::verifier::verify_output;
use crate::config::settings::TranscodeSettings;
use crate::modules::lesson::model::Lesson;
use crate::modules::lesson::repository::LessonStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Validated,
    ToolchainChecked,
    DirsReady,
    Processing,
    Keyed,
    Encoded,
    Verified,
    Introspected,
    Published,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Validated => "validated",
            Stage::ToolchainChecked => "toolchain_checked",
            Stage::DirsReady => "dirs_ready",
            Stage::Processing => "processing",
            Stage::Keyed => "keyed",
            Stage::Encoded => "encoded",
            Stage::Verified => "verified",
            Stage::Introspected => "introspected",
            Stage::Published => "published",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published {
        playlist: String,
        metadata: ProcessingMetadata,
        segments: usize,
    },
    /// A previous attempt committed `ready` but did not finish publication.
    Resumed { playlist: String },
    /// Redelivery for a lesson that is already fully published.
    AlreadyPublished,
}

/// Progress of the current attempt, kept so a failure can be logged with
/// its stage and recorded against the last known status.
struct Attempt {
    stage: Stage,
    status: VideoStatus,
}

impl Attempt {
    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        info!(stage = %stage, "➡️ Stage reached");
    }
}

pub struct TranscodeController {
    store: Arc<dyn LessonStore>,
    runner: Arc<dyn CommandRunner>,
    settings: TranscodeSettings,
    layout: StorageLayout,
    key_uris: KeyUriBuilder,
}

impl TranscodeController {
    pub fn new(
        store: Arc<dyn LessonStore>,
        runner: Arc<dyn CommandRunner>,
        settings: TranscodeSettings,
        layout: StorageLayout,
        key_uris: KeyUriBuilder,
    ) -> Self {
        Self {
            store,
            runner,
            settings,
            layout,
            key_uris,
        }
    }

    /// Run one attempt for `lesson_id`.
    pub async fn run(&self, lesson_id: i64) -> Result<Outcome, TranscodeError> {
        let lesson = self
            .store
            .find_by_id(lesson_id)
            .await
            .map_err(TranscodeError::Store)?
            .ok_or(TranscodeError::NotFound(lesson_id))?;

        if lesson.status() == VideoStatus::Ready {
            return self.resume_publication(&lesson).await;
        }

        let mut attempt = Attempt {
            stage: Stage::Start,
            status: lesson.status(),
        };

        match self.execute(&lesson, &mut attempt).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(
                    lesson_id,
                    stage = %attempt.stage,
                    kind = %err.kind(),
                    "❌ Transcode attempt failed: {}",
                    err
                );
                self.record_failure(lesson_id, attempt.status).await;
                Err(err)
            }
        }
    }

    async fn execute(&self, lesson: &Lesson, attempt: &mut Attempt) -> Result<Outcome, TranscodeError> {
        let request = self.build_request(lesson)?;

        let source = validate_source(&request.source_path).await?;
        info!(
            "✅ Source validated: {} ({}, {})",
            request.source_path.display(),
            source.kind,
            format_bytes(source.size)
        );
        attempt.advance(Stage::Validated);

        check_encoder(self.runner.as_ref(), &self.settings).await?;
        attempt.advance(Stage::ToolchainChecked);

        self.prepare_output_dir(&request.output_dir).await?;
        attempt.advance(Stage::DirsReady);

        let processing = attempt
            .status
            .transition(StatusEvent::AttemptStarted)
            .map_err(|e| TranscodeError::InvalidInput(e.to_string()))?;
        self.store
            .mark_processing(lesson.id, OffsetDateTime::now_utc())
            .await
            .map_err(TranscodeError::Store)?;
        attempt.status = processing;
        attempt.advance(Stage::Processing);

        let keys = provision_keys(&request.output_dir, &request.key_uri).await?;
        info!(
            key_file = %keys.key_file.display(),
            iv = %keys.iv_hex,
            "🔑 Encryption key provisioned"
        );
        attempt.advance(Stage::Keyed);

        run_encoder(self.runner.as_ref(), &self.settings, &request, &keys).await?;
        attempt.advance(Stage::Encoded);

        let verified = verify_output(&request.output_dir).await?;
        attempt.advance(Stage::Verified);

        // Metadata describes the upload, not the HLS output.
        let metadata = introspect(self.runner.as_ref(), &self.settings, &request.source_path).await;
        attempt.advance(Stage::Introspected);

        let ready = attempt
            .status
            .transition(StatusEvent::AttemptSucceeded)
            .map_err(|e| TranscodeError::InvalidInput(e.to_string()))?;
        self.store
            .mark_ready(lesson.id, &metadata)
            .await
            .map_err(TranscodeError::Store)?;
        attempt.status = ready;

        let playlist = self
            .finish_publication(lesson.id, Some(request.source_path.as_path()))
            .await?;
        attempt.advance(Stage::Published);

        info!(
            "✅ Lesson {} published at {} ({} segments)",
            lesson.id,
            playlist,
            verified.segments.len()
        );

        Ok(Outcome::Published {
            playlist,
            metadata,
            segments: verified.segments.len(),
        })
    }

    fn build_request(&self, lesson: &Lesson) -> Result<TranscodeRequest, TranscodeError> {
        let video_path = lesson
            .video_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TranscodeError::InvalidInput("video path is empty".to_string()))?;

        let key_uri = self
            .key_uris
            .for_lesson(lesson.id)
            .map_err(|e| TranscodeError::InvalidInput(format!("cannot build key URI: {e}")))?;

        Ok(TranscodeRequest {
            lesson_id: lesson.id,
            source_path: self.layout.resolve(video_path),
            output_dir: self.layout.hls_dir(lesson.id),
            key_uri,
        })
    }

    /// Create the output directory, or clear playlist and segments left by
    /// an earlier attempt so a retry cannot publish stale segments.
    async fn prepare_output_dir(&self, dir: &Path) -> Result<(), TranscodeError> {
        let exists = tokio::fs::try_exists(dir)
            .await
            .map_err(|e| TranscodeError::io("checking output directory", e))?;

        if !exists {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| TranscodeError::io("creating output directory", e))?;
            info!("📁 Created output directory {}", dir.display());
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| TranscodeError::io("listing output directory", e))?;
        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TranscodeError::io("listing output directory", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let stale = name == PLAYLIST_FILE || (name.starts_with("segment_") && name.ends_with(".ts"));
            if stale {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| TranscodeError::io("removing stale output", e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("🧹 Removed {} stale files from {}", removed, dir.display());
        }
        Ok(())
    }

    /// Delete the upload and point the lesson at its playlist. Must only be
    /// called once `ready` has been committed.
    async fn finish_publication(
        &self,
        lesson_id: i64,
        source: Option<&Path>,
    ) -> Result<String, TranscodeError> {
        if let Some(source) = source {
            match tokio::fs::remove_file(source).await {
                Ok(()) => info!("🗑️ Removed original upload {}", source.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(TranscodeError::io("removing original upload", e)),
            }
        }

        let playlist = self.layout.playlist_relative(lesson_id);
        self.store
            .update_video_path(lesson_id, &playlist)
            .await
            .map_err(TranscodeError::Store)?;
        Ok(playlist)
    }

    async fn resume_publication(&self, lesson: &Lesson) -> Result<Outcome, TranscodeError> {
        let playlist = self.layout.playlist_relative(lesson.id);
        let stored = lesson.video_path.as_deref().map(str::trim).unwrap_or_default();

        if stored == playlist {
            info!("Lesson {} is already published, nothing to do", lesson.id);
            return Ok(Outcome::AlreadyPublished);
        }

        let hls_dir = self.layout.hls_dir(lesson.id);
        let source = (!stored.is_empty()).then(|| self.layout.resolve(stored));
        if let Some(source) = &source {
            if modified_after(source, &hls_dir.join(PLAYLIST_FILE)).await {
                return Err(TranscodeError::InvalidInput(format!(
                    "lesson {} is ready but {} was uploaded after its output",
                    lesson.id,
                    source.display()
                )));
            }
        }

        warn!(
            "Lesson {} is ready but still points at {:?}, finishing publication",
            lesson.id, stored
        );
        verify_output(&hls_dir).await?;

        let playlist = self.finish_publication(lesson.id, source.as_deref()).await?;
        Ok(Outcome::Resumed { playlist })
    }

    async fn record_failure(&self, lesson_id: i64, current: VideoStatus) {
        match current.transition(StatusEvent::AttemptFailed) {
            Ok(next) => {
                if let Err(e) = self.store.update_status(lesson_id, next).await {
                    error!("Could not record failure for lesson {}: {:#}", lesson_id, e);
                }
            }
            Err(e) => warn!("Leaving status of lesson {} unchanged: {}", lesson_id, e),
        }
    }

    /// Record a failed attempt that never returned, e.g. one cancelled by
    /// the worker's unit timeout.
    pub async fn abandon_attempt(&self, lesson_id: i64) {
        match self.store.find_by_id(lesson_id).await {
            Ok(Some(lesson)) => self.record_failure(lesson_id, lesson.status()).await,
            Ok(None) => warn!("Lesson {} disappeared during processing", lesson_id),
            Err(e) => error!("Could not load lesson {}: {:#}", lesson_id, e),
        }
    }

    /// Final-failure hook: the queue has given up on this lesson. Marks it
    /// failed and removes its output directory. Errors here are logged and
    /// never replace the original failure.
    pub async fn on_final_failure(&self, lesson_id: i64, reason: &str) {
        error!(lesson_id, reason, "💀 Video processing permanently failed");

        let status = match self.store.find_by_id(lesson_id).await {
            Ok(Some(lesson)) => Some(lesson.status()),
            Ok(None) => None,
            Err(e) => {
                error!("Could not load lesson {}: {:#}", lesson_id, e);
                None
            }
        };

        if status == Some(VideoStatus::Ready) {
            warn!("Lesson {} is ready, keeping its published output", lesson_id);
            return;
        }
        if let Some(status) = status {
            self.record_failure(lesson_id, status).await;
        }

        self.cleanup(lesson_id).await;
    }

    async fn cleanup(&self, lesson_id: i64) {
        let dir = self.layout.hls_dir(lesson_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("🧹 Cleaned up {}", dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("Failed to clean up {}: {}", dir.display(), e),
        }
    }
}

/// Whether `path` exists and was modified after `reference`. Missing files
/// or timestamps count as not newer.
async fn modified_after(path: &Path, reference: &Path) -> bool {
    async fn modified(path: &Path) -> Option<SystemTime> {
        tokio::fs::metadata(path).await.ok()?.modified().ok()
    }

    match (modified(path).await, modified(reference).await) {
        (Some(changed), Some(baseline)) => changed > baseline,
        _ => false,
    }
}
