//! Test doubles and fixtures shared by the pipeline tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use time::OffsetDateTime;

use super::command::{CommandRunner, RunError, ToolCommand, ToolOutput};
use super::keys::{KEY_LEN, KeyUriBuilder};
use super::probe::ProcessingMetadata;
use super::request::{KEY_FILE, PLAYLIST_FILE, StorageLayout, TranscodeRequest};
use super::status::VideoStatus;
use crate::modules::lesson::model::Lesson;
use crate::modules::lesson::repository::LessonStore;

/// Leading bytes of an ISO base media file with an `isom` brand.
pub const MP4_HEAD: &[u8] = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00isomiso2avc1mp41";

/// Write an MP4-looking file of exactly `len` bytes. Large sizes stay sparse.
pub fn write_sample_mp4(path: &Path, len: u64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, MP4_HEAD).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
}

pub fn playlist_text(segments: usize) -> String {
    let mut text = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"https://learn.example.com/api/v1/lessons/1/key\",IV=0x00000000000000000000000000000001\n",
    );
    for i in 0..segments {
        text.push_str(&format!("#EXTINF:6.000000,\nsegment_{i:03}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn write_segments(dir: &Path, segments: usize) {
    for i in 0..segments {
        std::fs::write(dir.join(format!("segment_{i:03}.ts")), [0x47u8; 188]).unwrap();
    }
}

/// A complete, verifiable HLS output directory.
pub fn write_hls_output(dir: &Path, segments: usize) {
    std::fs::create_dir_all(dir).unwrap();
    write_segments(dir, segments);
    std::fs::write(dir.join(PLAYLIST_FILE), playlist_text(segments)).unwrap();
    std::fs::write(dir.join(KEY_FILE), [7u8; KEY_LEN]).unwrap();
}

pub fn request_in(root: &Path, lesson_id: i64) -> TranscodeRequest {
    let layout = StorageLayout::new(root).unwrap();
    TranscodeRequest {
        lesson_id,
        source_path: layout.resolve("uploads/lesson.mp4"),
        output_dir: layout.hls_dir(lesson_id),
        key_uri: KeyUriBuilder::new("https://learn.example.com/api/v1/lessons/")
            .unwrap()
            .for_lesson(lesson_id)
            .unwrap(),
    }
}

#[derive(Debug, Clone)]
pub enum EncodeBehavior {
    Succeed { segments: usize },
    Exit { code: i32, stderr: String },
    /// Segments written but the playlist never finalized.
    TruncatedPlaylist,
    TimedOut,
    /// Output is complete but the key file was overwritten with a short one.
    ShortKey,
    /// Exits cleanly after writing a finalized playlist with no segments.
    NoSegments,
    /// Never returns.
    Hang,
}

#[derive(Debug, Clone)]
pub enum ProbeBehavior {
    Duration(String),
    Fail,
}

/// Scripted stand-in for ffmpeg and ffprobe. The encode branch writes files
/// into the directory named by `-hls_segment_filename`, the way the real
/// encoder would.
pub struct ScriptedRunner {
    ffmpeg_available: bool,
    encode: EncodeBehavior,
    probe: ProbeBehavior,
    calls: Mutex<Vec<ToolCommand>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            ffmpeg_available: true,
            encode: EncodeBehavior::Succeed { segments: 3 },
            probe: ProbeBehavior::Duration("125.6".into()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedRunner {
    pub fn without_ffmpeg(mut self) -> Self {
        self.ffmpeg_available = false;
        self
    }

    pub fn encode(mut self, behavior: EncodeBehavior) -> Self {
        self.encode = behavior;
        self
    }

    pub fn probe(mut self, behavior: ProbeBehavior) -> Self {
        self.probe = behavior;
        self
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    fn version(&self, command: &ToolCommand) -> Result<ToolOutput, RunError> {
        if !self.ffmpeg_available {
            return Err(RunError::Spawn {
                program: command.name(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            });
        }
        Ok(ok_output("ffmpeg version 6.1.1 Copyright (c) 2000-2023 the FFmpeg developers\n"))
    }

    fn ffprobe(&self) -> ToolOutput {
        match &self.probe {
            ProbeBehavior::Duration(secs) => ok_output(&format!(
                r#"{{"format": {{"duration": "{secs}"}}, "streams": []}}"#
            )),
            ProbeBehavior::Fail => ToolOutput {
                exit_code: Some(1),
                stderr: "Invalid data found when processing input".into(),
                ..ToolOutput::default()
            },
        }
    }

    fn ffmpeg_encode(&self, command: &ToolCommand) -> Result<ToolOutput, RunError> {
        let output_dir = command
            .args
            .iter()
            .position(|a| a == "-hls_segment_filename")
            .and_then(|i| command.args.get(i + 1))
            .and_then(|pattern| Path::new(pattern).parent().map(PathBuf::from))
            .unwrap();

        match &self.encode {
            EncodeBehavior::Succeed { segments } => {
                write_segments(&output_dir, *segments);
                std::fs::write(output_dir.join(PLAYLIST_FILE), playlist_text(*segments)).unwrap();
                Ok(ok_output(""))
            }
            EncodeBehavior::Exit { code, stderr } => Ok(ToolOutput {
                exit_code: Some(*code),
                stderr: stderr.clone(),
                ..ToolOutput::default()
            }),
            EncodeBehavior::TruncatedPlaylist => {
                write_segments(&output_dir, 2);
                let truncated = playlist_text(2).replace("#EXT-X-ENDLIST\n", "");
                std::fs::write(output_dir.join(PLAYLIST_FILE), truncated).unwrap();
                Ok(ok_output(""))
            }
            EncodeBehavior::TimedOut => Err(RunError::TimedOut {
                program: command.name(),
                timeout: command.timeout,
            }),
            EncodeBehavior::ShortKey => {
                write_segments(&output_dir, 2);
                std::fs::write(output_dir.join(PLAYLIST_FILE), playlist_text(2)).unwrap();
                std::fs::write(output_dir.join(KEY_FILE), [1u8; 8]).unwrap();
                Ok(ok_output(""))
            }
            EncodeBehavior::NoSegments => {
                std::fs::write(output_dir.join(PLAYLIST_FILE), playlist_text(0)).unwrap();
                Ok(ok_output(""))
            }
            EncodeBehavior::Hang => unreachable!("hanging encodes are awaited in run"),
        }
    }
}

fn ok_output(stdout: &str) -> ToolOutput {
    ToolOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
        elapsed: Duration::from_millis(5),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, RunError> {
        self.calls.lock().unwrap().push(command.clone());

        if command.args.iter().any(|a| a == "-version") {
            self.version(command)
        } else if command.args.iter().any(|a| a == "-show_format") {
            Ok(self.ffprobe())
        } else if matches!(self.encode, EncodeBehavior::Hang) {
            std::future::pending().await
        } else {
            self.ffmpeg_encode(command)
        }
    }
}

pub fn lesson(id: i64, video_path: Option<&str>, status: VideoStatus) -> Lesson {
    Lesson {
        id,
        video_path: video_path.map(String::from),
        video_status: status.as_str().to_string(),
        video_duration: None,
        video_size: None,
        processing_started_at: None,
        updated_at: OffsetDateTime::now_utc(),
    }
}

/// In-memory record store that also remembers every status it was asked to
/// write, per lesson.
#[derive(Default)]
pub struct MemoryLessonStore {
    lessons: Mutex<HashMap<i64, Lesson>>,
    history: Mutex<HashMap<i64, Vec<VideoStatus>>>,
}

impl MemoryLessonStore {
    pub fn insert(&self, lesson: Lesson) {
        self.lessons.lock().unwrap().insert(lesson.id, lesson);
    }

    pub fn get(&self, id: i64) -> Option<Lesson> {
        self.lessons.lock().unwrap().get(&id).cloned()
    }

    pub fn status_history(&self, id: i64) -> Vec<VideoStatus> {
        self.history.lock().unwrap().get(&id).cloned().unwrap_or_default()
    }

    fn update(&self, id: i64, apply: impl FnOnce(&mut Lesson)) -> Result<()> {
        let mut lessons = self.lessons.lock().unwrap();
        let lesson = lessons
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Lesson {} not found", id))?;
        apply(lesson);
        lesson.updated_at = OffsetDateTime::now_utc();

        let status = lesson.status();
        self.history.lock().unwrap().entry(id).or_default().push(status);
        Ok(())
    }
}

#[async_trait]
impl LessonStore for MemoryLessonStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Lesson>> {
        Ok(self.get(id))
    }

    async fn mark_processing(&self, id: i64, started_at: OffsetDateTime) -> Result<()> {
        self.update(id, |l| {
            l.video_status = VideoStatus::Processing.as_str().to_string();
            l.processing_started_at = Some(started_at);
        })
    }

    async fn update_status(&self, id: i64, status: VideoStatus) -> Result<()> {
        self.update(id, |l| l.video_status = status.as_str().to_string())
    }

    async fn mark_ready(&self, id: i64, metadata: &ProcessingMetadata) -> Result<()> {
        self.update(id, |l| {
            l.video_status = VideoStatus::Ready.as_str().to_string();
            l.video_duration = metadata.duration_secs;
            l.video_size = metadata.size_bytes;
        })
    }

    async fn update_video_path(&self, id: i64, video_path: &str) -> Result<()> {
        let mut lessons = self.lessons.lock().unwrap();
        let lesson = lessons
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Lesson {} not found", id))?;
        lesson.video_path = Some(video_path.to_string());
        Ok(())
    }
}
