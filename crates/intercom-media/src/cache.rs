//! Synthesized phrase cache
//!
//! Content-addressed store of synthesized SLIN audio. The key is the
//! lowercased hex SHA-256 digest of the voice name and the text; entries
//! live as `<hex>.slin` files under the cache directory. Writes go through
//! a temporary file and a rename so a crashed write never leaves a
//! half-written entry behind.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;

/// File-backed phrase cache.
#[derive(Debug, Clone)]
pub struct PhraseCache {
    dir: PathBuf,
}

impl PhraseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache key for a `(voice, text)` pair.
    pub fn key(voice: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(voice.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, voice: &str, text: &str) -> PathBuf {
        self.dir.join(format!("{}.slin", Self::key(voice, text)))
    }

    /// Look up cached audio. Read failures count as misses.
    pub async fn get(&self, voice: &str, text: &str) -> Option<Bytes> {
        let path = self.entry_path(voice, text);
        match tokio::fs::read(&path).await {
            Ok(pcm) => {
                debug!(path = %path.display(), "phrase cache hit");
                Some(Bytes::from(pcm))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "phrase cache read failed");
                None
            }
        }
    }

    /// Store synthesized audio atomically.
    pub async fn put(&self, voice: &str, text: &str, pcm: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.entry_path(voice, text);
        let tmp = path.with_extension("slin.tmp");
        tokio::fs::write(&tmp, pcm).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bytes = pcm.len(), "phrase cached");
        Ok(path)
    }

    /// Whether an entry exists without reading it.
    pub async fn contains(&self, voice: &str, text: &str) -> bool {
        tokio::fs::try_exists(self.entry_path(voice, text))
            .await
            .unwrap_or(false)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
