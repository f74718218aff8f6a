use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::env::{self, EnvKey};
use crate::workers::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub amqp_url: String,
    pub storage_root: PathBuf,
    pub key_uri_base: String,
    pub transcode: TranscodeSettings,
    pub retry: RetryPolicy,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        let transcode = TranscodeSettings {
            ffmpeg_bin: PathBuf::from(env::get_or(EnvKey::FfmpegPath, "ffmpeg")),
            ffprobe_bin: PathBuf::from(env::get_or(EnvKey::FfprobePath, "ffprobe")),
            workers: env::get_parsed(EnvKey::TranscodeWorkers, 1usize).max(1),
            queue: env::get_or(EnvKey::TranscodeQueue, "video-processing"),
            ..TranscodeSettings::default()
        };

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl)?,
            amqp_url: env::get(EnvKey::AmqpUrl)?,
            storage_root: PathBuf::from(env::get_or(EnvKey::StorageRoot, "storage/app")),
            key_uri_base: env::get_or(EnvKey::KeyUriBase, "http://localhost:3000/api/v1/lessons/"),
            transcode,
            retry: RetryPolicy::default(),
        })
    }
}

/// Tool locations, subprocess time budgets and worker-lane sizing for the
/// transcode pipeline.
#[derive(Clone, Debug)]
pub struct TranscodeSettings {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Hard limit on a single encoder run.
    pub encoder_timeout: Duration,
    /// Limit on `ffmpeg -version`.
    pub toolchain_timeout: Duration,
    pub probe_timeout: Duration,
    /// Cadence of the "still encoding" log line.
    pub heartbeat_every: Duration,
    /// Wall-clock budget for one whole attempt, enforced by the worker.
    pub job_timeout: Duration,
    pub workers: usize,
    pub queue: String,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encoder_timeout: Duration::from_secs(3600),
            toolchain_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
            heartbeat_every: Duration::from_secs(30),
            job_timeout: Duration::from_secs(1800),
            workers: 1,
            queue: "video-processing".to_string(),
        }
    }
}

impl TranscodeSettings {
    pub fn retry_queue(&self) -> String {
        format!("{}.retry", self.queue)
    }

    /// Swap bare tool names for their absolute `PATH` location. Tools that
    /// cannot be found are left as-is; the availability check reports them
    /// per job.
    pub fn resolve_tools(&mut self) {
        for bin in [&mut self.ffmpeg_bin, &mut self.ffprobe_bin] {
            match which::which(&*bin) {
                Ok(path) => {
                    info!("🔧 Using {}", path.display());
                    *bin = path;
                }
                Err(e) => warn!("Could not resolve {}: {}", bin.display(), e),
            }
        }
    }
}
