//! Structural sanity check of encoder output.
//!
//! This is not a media-integrity check. It catches runs that were killed or
//! truncated mid-write but still left files behind.

use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use super::error::TranscodeError;
use super::keys::KEY_LEN;
use super::request::{KEY_FILE, PLAYLIST_FILE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedOutput {
    pub segments: Vec<String>,
}

/// Segment URIs referenced by a media playlist, in order.
pub fn segment_references(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| line.ends_with(".ts"))
        .map(String::from)
        .collect()
}

pub async fn verify_output(output_dir: &Path) -> Result<VerifiedOutput, TranscodeError> {
    let playlist_path = output_dir.join(PLAYLIST_FILE);
    let playlist = match tokio::fs::read_to_string(&playlist_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(TranscodeError::IncompleteOutput(
                "playlist was not created".to_string(),
            ));
        }
        Err(e) => return Err(TranscodeError::io("reading playlist", e)),
    };

    if playlist.trim().is_empty() {
        return Err(TranscodeError::IncompleteOutput("playlist is empty".to_string()));
    }

    let segments = segment_references(&playlist);
    if segments.is_empty() {
        return Err(TranscodeError::IncompleteOutput(
            "playlist references no segments".to_string(),
        ));
    }

    if !playlist.contains("#EXT-X-ENDLIST") {
        return Err(TranscodeError::IncompleteOutput(
            "playlist was not finalized (no #EXT-X-ENDLIST)".to_string(),
        ));
    }

    if !playlist.contains("METHOD=AES-128") {
        return Err(TranscodeError::IncompleteOutput(
            "playlist does not declare AES-128 encryption".to_string(),
        ));
    }

    for segment in &segments {
        let len = tokio::fs::metadata(output_dir.join(segment))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if len == 0 {
            return Err(TranscodeError::IncompleteOutput(format!(
                "segment {segment} is missing or empty"
            )));
        }
    }

    match tokio::fs::metadata(output_dir.join(KEY_FILE)).await {
        Ok(m) if m.len() == KEY_LEN as u64 => {}
        Ok(m) => {
            return Err(TranscodeError::CorruptKey(format!(
                "expected {KEY_LEN} bytes, found {}",
                m.len()
            )));
        }
        Err(_) => {
            return Err(TranscodeError::CorruptKey("key file is missing".to_string()));
        }
    }

    info!(
        "✅ Output verified in {} - {} segments",
        output_dir.display(),
        segments.len()
    );

    Ok(VerifiedOutput { segments })
}
