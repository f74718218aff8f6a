use std::path::{Path, PathBuf};

use url::Url;

pub const PLAYLIST_FILE: &str = "index.m3u8";
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";
pub const KEY_FILE: &str = "enc.key";
pub const KEY_INFO_FILE: &str = "enc.keyinfo";

const PRIVATE_DIR: &str = "private_videos";

/// Where sources live and where HLS output goes.
///
/// Paths stored on lessons are relative to `root`; everything handed to
/// subprocesses is absolute.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            root: std::path::absolute(root.as_ref())?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, stored_path: &str) -> PathBuf {
        self.root.join(stored_path)
    }

    /// Output directory relative to the storage root.
    pub fn hls_dir_relative(&self, lesson_id: i64) -> String {
        format!("{PRIVATE_DIR}/hls/item_{lesson_id}")
    }

    pub fn hls_dir(&self, lesson_id: i64) -> PathBuf {
        self.root.join(self.hls_dir_relative(lesson_id))
    }

    /// Playlist path as stored on the lesson once published.
    pub fn playlist_relative(&self, lesson_id: i64) -> String {
        format!("{}/{PLAYLIST_FILE}", self.hls_dir_relative(lesson_id))
    }
}

/// Everything one attempt needs to know about its lesson. Built fresh per
/// delivery and never persisted.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub lesson_id: i64,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub key_uri: Url,
}
