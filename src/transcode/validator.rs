//! Source file preconditions, checked before any expensive work starts.

use std::fmt;
use std::path::Path;

use tokio::io::AsyncReadExt;

use super::error::TranscodeError;

/// Container family detected from the first bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Mp4,
    QuickTime,
    Avi,
    Wmv,
    WebM,
    Matroska,
    ThreeGpp,
    AudioMp4,
    Unknown,
}

impl MediaKind {
    pub fn mime(&self) -> &'static str {
        match self {
            MediaKind::Mp4 => "video/mp4",
            MediaKind::QuickTime => "video/quicktime",
            MediaKind::Avi => "video/x-msvideo",
            MediaKind::Wmv => "video/x-ms-wmv",
            MediaKind::WebM => "video/webm",
            MediaKind::Matroska => "video/x-matroska",
            MediaKind::ThreeGpp => "video/3gpp",
            MediaKind::AudioMp4 => "audio/mp4",
            MediaKind::Unknown => "application/octet-stream",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            MediaKind::Mp4 | MediaKind::QuickTime | MediaKind::Avi | MediaKind::Wmv | MediaKind::WebM
        )
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

const SNIFF_LEN: usize = 64;
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const ASF_HEADER_GUID: [u8; 16] = [
    0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];

/// Classify a file by its leading bytes.
pub fn sniff(head: &[u8]) -> MediaKind {
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        let brand = &head[8..12];
        return match brand {
            b"qt  " => MediaKind::QuickTime,
            b"M4A " | b"M4B " => MediaKind::AudioMp4,
            _ if brand.starts_with(b"3g") => MediaKind::ThreeGpp,
            _ => MediaKind::Mp4,
        };
    }

    // Classic QuickTime files open directly with an atom other than ftyp.
    if head.len() >= 8 && matches!(&head[4..8], b"moov" | b"mdat" | b"wide" | b"free" | b"skip") {
        return MediaKind::QuickTime;
    }

    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"AVI " {
        return MediaKind::Avi;
    }

    if head.starts_with(&ASF_HEADER_GUID) {
        return MediaKind::Wmv;
    }

    if head.starts_with(&EBML_MAGIC) {
        // The DocType string sits inside the EBML header.
        if contains(head, b"webm") {
            return MediaKind::WebM;
        }
        return MediaKind::Matroska;
    }

    MediaKind::Unknown
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Debug, Clone, Copy)]
pub struct SourceInfo {
    pub kind: MediaKind,
    pub size: u64,
}

/// Check that the source exists, is non-empty, and holds an allowed video
/// container.
pub async fn validate_source(path: &Path) -> Result<SourceInfo, TranscodeError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        _ => {
            return Err(TranscodeError::InvalidInput(format!(
                "source file does not exist: {}",
                path.display()
            )));
        }
    };

    if metadata.len() == 0 {
        return Err(TranscodeError::InvalidInput(format!(
            "source file is empty: {}",
            path.display()
        )));
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TranscodeError::InvalidInput(format!("cannot open source file: {e}")))?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .await
        .map_err(|e| TranscodeError::InvalidInput(format!("cannot read source file: {e}")))?;

    let kind = sniff(&head);
    if !kind.is_allowed() {
        return Err(TranscodeError::InvalidInput(format!(
            "unsupported media type: {kind}"
        )));
    }

    Ok(SourceInfo {
        kind,
        size: metadata.len(),
    })
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value > 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
