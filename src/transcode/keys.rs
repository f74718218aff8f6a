use std::path::{Path, PathBuf};

use url::Url;

use super::error::TranscodeError;
use super::request::{KEY_FILE, KEY_INFO_FILE};

pub const KEY_LEN: usize = 16;

/// AES-128 material for one attempt. Regenerated on every attempt.
#[derive(Debug, Clone)]
pub struct EncryptionKeyMaterial {
    pub key_file: PathBuf,
    pub key_info_file: PathBuf,
    pub iv_hex: String,
}

/// Builds the URI players use to fetch a lesson's key. The serving layer
/// lives elsewhere; this only has to agree with its route.
#[derive(Debug, Clone)]
pub struct KeyUriBuilder {
    base: Url,
}

impl KeyUriBuilder {
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    pub fn for_lesson(&self, lesson_id: i64) -> Result<Url, url::ParseError> {
        self.base.join(&format!("{lesson_id}/key"))
    }
}

/// Write a fresh key and key-info descriptor into `output_dir`, which must
/// already exist. Any previous material is overwritten.
pub async fn provision_keys(
    output_dir: &Path,
    key_uri: &Url,
) -> Result<EncryptionKeyMaterial, TranscodeError> {
    let key: [u8; KEY_LEN] = rand::random();
    let iv: [u8; KEY_LEN] = rand::random();
    let iv_hex = hex::encode(iv);

    let key_file = output_dir.join(KEY_FILE);
    tokio::fs::write(&key_file, key)
        .await
        .map_err(|e| TranscodeError::io("writing key file", e))?;

    // Line order is fixed by ffmpeg's -hls_key_info_file format.
    let key_info_file = output_dir.join(KEY_INFO_FILE);
    let descriptor = format!("{}\n{}\n{}", key_uri, key_file.display(), iv_hex);
    tokio::fs::write(&key_info_file, descriptor)
        .await
        .map_err(|e| TranscodeError::io("writing key info file", e))?;

    Ok(EncryptionKeyMaterial {
        key_file,
        key_info_file,
        iv_hex,
    })
}
