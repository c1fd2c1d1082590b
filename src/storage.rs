use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::config::StorageConfig;

/// Durable storage for generated audio. Keys are flat file names.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns the public URL.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Removes the object behind a URL previously returned by `put`.
    /// Missing objects are not an error.
    async fn delete(&self, url: &str) -> Result<()>;
}

/// Writes objects under a directory that a web server exposes at `public_prefix`.
pub struct LocalObjectStore {
    root: PathBuf,
    public_prefix: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_prefix: &str) -> Self {
        Self {
            root: root.into(),
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone(), &config.public_prefix)
    }

    fn key_for_url<'a>(&self, url: &'a str) -> &'a str {
        url.strip_prefix(&self.public_prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url))
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
        bail!("Invalid object key '{}'", key);
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        check_key(key)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        let path = self.root.join(key);
        let partial = self.root.join(format!(".{}.partial", key));
        tokio::fs::write(&partial, bytes)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, &path)
            .await
            .with_context(|| format!("Failed to move audio into {}", path.display()))?;

        debug!(key, content_type, size = bytes.len(), "Stored object");
        Ok(format!("{}/{}", self.public_prefix, key))
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let key = self.key_for_url(url);
        check_key(key)?;

        match tokio::fs::remove_file(self.root.join(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_creates_directory_and_returns_url() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("audio");
        let store = LocalObjectStore::new(&root, "/uploads/audio/");

        let url = store.put("owner-1.mp3", b"ID3", "audio/mpeg").await.unwrap();

        assert_eq!(url, "/uploads/audio/owner-1.mp3");
        assert_eq!(std::fs::read(root.join("owner-1.mp3")).unwrap(), b"ID3");
        assert!(!root.join(".owner-1.mp3.partial").exists());
    }

    #[tokio::test]
    async fn test_delete_is_tolerant_of_missing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "/uploads/audio");

        let url = store.put("a.mp3", b"x", "audio/mpeg").await.unwrap();
        store.delete(&url).await.unwrap();
        assert!(!dir.path().join("a.mp3").exists());

        store.delete(&url).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "/uploads/audio");

        assert!(store.put("../escape.mp3", b"x", "audio/mpeg").await.is_err());
        assert!(store.put("", b"x", "audio/mpeg").await.is_err());
        assert!(store.delete("/uploads/audio/../../etc/passwd").await.is_err());
    }
}
