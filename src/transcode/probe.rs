use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use super::command::{CommandRunner, ToolCommand};
use crate::config::settings::TranscodeSettings;

/// Duration and size attached to a lesson on success. Either may be absent;
/// introspection never blocks publication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingMetadata {
    pub duration_secs: Option<i64>,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    duration: Option<String>,
}

fn round_secs(raw: &str) -> Option<i64> {
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs.round() as i64)
}

/// Container duration first, then the first video stream that carries one.
pub fn parse_duration(json: &str) -> Option<i64> {
    let probe: FfprobeOutput = serde_json::from_str(json).ok()?;

    if let Some(secs) = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(round_secs)
    {
        return Some(secs);
    }

    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video") && s.duration.is_some())
        .and_then(|s| s.duration.as_deref())
        .and_then(round_secs)
}

/// Best-effort probe of `path`. Size comes from the filesystem, not from
/// ffprobe.
pub async fn introspect(
    runner: &dyn CommandRunner,
    settings: &TranscodeSettings,
    path: &Path,
) -> ProcessingMetadata {
    let size_bytes = match tokio::fs::metadata(path).await {
        Ok(m) => i64::try_from(m.len()).ok(),
        Err(e) => {
            warn!("Could not stat {}: {}", path.display(), e);
            None
        }
    };

    let cmd = ToolCommand::new(&settings.ffprobe_bin, settings.probe_timeout).args([
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        path.display().to_string(),
    ]);

    let duration_secs = match runner.run(&cmd).await {
        Ok(output) if output.success() => {
            let duration = parse_duration(&output.stdout);
            if duration.is_none() {
                warn!("ffprobe reported no usable duration for {}", path.display());
            }
            duration
        }
        Ok(output) => {
            warn!(
                "ffprobe failed for {} (exit code {:?}): {}",
                path.display(),
                output.exit_code,
                output.stderr.trim()
            );
            None
        }
        Err(e) => {
            warn!("ffprobe could not run for {}: {}", path.display(), e);
            None
        }
    };

    info!(
        duration_secs = ?duration_secs,
        size_bytes = ?size_bytes,
        "📏 Media introspected"
    );

    ProcessingMetadata {
        duration_secs,
        size_bytes,
    }
}
