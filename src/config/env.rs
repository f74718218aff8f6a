use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    AmqpUrl,
    StorageRoot,
    KeyUriBase,
    FfmpegPath,
    FfprobePath,
    TranscodeWorkers,
    TranscodeQueue,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::AmqpUrl => "AMQP_URL",
            EnvKey::StorageRoot => "STORAGE_ROOT",
            EnvKey::KeyUriBase => "KEY_URI_BASE",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::TranscodeWorkers => "TRANSCODE_WORKERS",
            EnvKey::TranscodeQueue => "TRANSCODE_QUEUE",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
