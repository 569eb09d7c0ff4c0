//! Blob storage for synthesized speech clips and recorded user input.

use parlance_types::AudioEncoding;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object store holding audio clips under opaque keys.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, mime_type: &str) -> Result<(), StorageError>;

    /// Returns a URL the client can fetch `key` from.
    async fn get_url(&self, key: &str) -> Result<String, StorageError>;
}

/// Storage key of the clip synthesized for `message_id`.
pub fn audio_key(message_id: &str, encoding: AudioEncoding) -> String {
    let digest = Sha256::digest(message_id.as_bytes());
    format!("tts/{}.{}", hex::encode(digest), encoding.extension())
}

/// Storage key of the recording submitted as human message `message_id`.
pub fn input_key(message_id: &str, format: &str) -> String {
    let digest = Sha256::digest(message_id.as_bytes());
    format!("asr/{}.{}", hex::encode(digest), format)
}

fn check_key(key: &str) -> Result<(), StorageError> {
    let valid_chars = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    let normal = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if key.is_empty() || !valid_chars || !normal || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Stores clips in a local directory served by the router.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
}

impl LocalBlobStore {
    /// `public_url` may be empty, in which case URLs are server-relative.
    pub fn new(root: impl Into<PathBuf>, public_url: &str, url_prefix: &str) -> Self {
        Self {
            root: root.into(),
            base_url: format!(
                "{}/{}",
                public_url.trim_end_matches('/'),
                url_prefix.trim_matches('/')
            ),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, mime_type: &str) -> Result<(), StorageError> {
        check_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write under a temporary name so readers never see a partial clip.
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        tracing::debug!(key, mime_type, size = bytes.len(), "stored audio clip");
        Ok(())
    }

    async fn get_url(&self, key: &str) -> Result<String, StorageError> {
        check_key(key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }
}
