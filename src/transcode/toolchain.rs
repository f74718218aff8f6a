use tracing::info;

use super::command::{CommandRunner, ToolCommand};
use super::error::TranscodeError;
use crate::config::settings::TranscodeSettings;

/// Confirm ffmpeg can be launched. Returns its version banner.
pub async fn check_encoder(
    runner: &dyn CommandRunner,
    settings: &TranscodeSettings,
) -> Result<String, TranscodeError> {
    let cmd = ToolCommand::new(&settings.ffmpeg_bin, settings.toolchain_timeout).args(["-version"]);

    let output = runner
        .run(&cmd)
        .await
        .map_err(|e| TranscodeError::ToolchainUnavailable(e.to_string()))?;

    if !output.success() {
        return Err(TranscodeError::ToolchainUnavailable(format!(
            "{} -version exited with code {:?}: {}",
            cmd.name(),
            output.exit_code,
            output.stderr.trim()
        )));
    }

    let version = output.stdout.lines().next().unwrap_or_default().trim().to_string();
    info!("🎬 Encoder available: {}", version);
    Ok(version)
}
