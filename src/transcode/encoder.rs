//! HLS encode with per-segment AES-128.
//!
//! The argument profile is fixed: players already consuming these assets
//! depend on the segment naming, 6 s cadence and key-info driven encryption.
//! Bitrate and resolution caps bound worst-case encode time and storage
//! regardless of the upload.

use std::path::Path;

use tracing::{error, info};

use super::command::{CommandRunner, RunError, ToolCommand, ToolOutput};
use super::error::TranscodeError;
use super::keys::EncryptionKeyMaterial;
use super::request::{PLAYLIST_FILE, SEGMENT_PATTERN, TranscodeRequest};
use crate::config::settings::TranscodeSettings;

pub fn encoder_args(source: &Path, output_dir: &Path, key_info_file: &Path) -> Vec<String> {
    let segment_pattern = output_dir.join(SEGMENT_PATTERN);
    let playlist = output_dir.join(PLAYLIST_FILE);

    let mut args: Vec<String> = vec!["-i".into(), source.display().to_string()];
    // Video
    args.extend(
        [
            "-c:v", "libx264",
            "-preset", "medium",
            "-crf", "23",
            "-maxrate", "2M",
            "-bufsize", "4M",
            "-vf", "scale=-2:720",
        ]
        .map(String::from),
    );
    // Audio
    args.extend(["-c:a", "aac", "-b:a", "128k", "-ar", "44100"].map(String::from));
    // Packaging
    args.extend(
        [
            "-f", "hls",
            "-hls_time", "6",
            "-hls_list_size", "0",
            "-hls_segment_filename",
        ]
        .map(String::from),
    );
    args.push(segment_pattern.display().to_string());
    args.push("-hls_key_info_file".into());
    args.push(key_info_file.display().to_string());
    args.extend(
        [
            "-hls_flags", "independent_segments",
            "-threads", "0",
            "-movflags", "+faststart",
            "-loglevel", "warning",
            "-y",
        ]
        .map(String::from),
    );
    args.push(playlist.display().to_string());
    args
}

/// Run the encoder to completion. A non-zero exit or a timeout is an
/// `EncodingFailed`; the caller's retry policy decides what happens next.
pub async fn run_encoder(
    runner: &dyn CommandRunner,
    settings: &TranscodeSettings,
    request: &TranscodeRequest,
    keys: &EncryptionKeyMaterial,
) -> Result<ToolOutput, TranscodeError> {
    let cmd = ToolCommand::new(&settings.ffmpeg_bin, settings.encoder_timeout)
        .args(encoder_args(
            &request.source_path,
            &request.output_dir,
            &keys.key_info_file,
        ))
        .heartbeat(settings.heartbeat_every);

    info!("🎥 Starting encode for lesson {}", request.lesson_id);

    let output = match runner.run(&cmd).await {
        Ok(output) => output,
        Err(RunError::Spawn { program, source }) => {
            return Err(TranscodeError::ToolchainUnavailable(format!(
                "failed to spawn {program}: {source}"
            )));
        }
        Err(e @ RunError::TimedOut { .. }) => {
            error!(lesson_id = request.lesson_id, "❌ Encoder {}", e);
            return Err(TranscodeError::EncodingFailed {
                exit_code: None,
                stderr: e.to_string(),
            });
        }
        Err(e @ RunError::Wait { .. }) => {
            return Err(TranscodeError::EncodingFailed {
                exit_code: None,
                stderr: e.to_string(),
            });
        }
    };

    let elapsed_secs = output.elapsed.as_secs_f64();
    if !output.success() {
        error!(
            lesson_id = request.lesson_id,
            exit_code = ?output.exit_code,
            elapsed_secs,
            error_output = %output.stderr.trim(),
            "❌ Encoder exited with failure"
        );
        return Err(TranscodeError::EncodingFailed {
            exit_code: output.exit_code,
            stderr: output.stderr,
        });
    }

    info!(
        "✅ Encode finished for lesson {} in {:.2}s",
        request.lesson_id, elapsed_secs
    );
    Ok(output)
}
