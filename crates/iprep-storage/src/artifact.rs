use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for captured portal exports.
///
/// Layout: `<root>/<YYYYmmdd_HHMMSS>/<source>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes bytes under their content hash via a temp file and an atomic rename.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(captured_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Most recent artifact captured for `source`, by capture stamp.
    pub async fn latest_artifact(&self, source: &str) -> anyhow::Result<Option<PathBuf>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(None);
        }
        let mut stamps = Vec::new();
        let mut dir = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stamps.push(entry.path());
            }
        }
        // Stamps are zero-padded so lexical order is chronological.
        stamps.sort();

        for stamp in stamps.into_iter().rev() {
            let source_dir = stamp.join(source);
            if !fs::try_exists(&source_dir).await.unwrap_or(false) {
                continue;
            }
            let mut files = Vec::new();
            let mut inner = fs::read_dir(&source_dir)
                .await
                .with_context(|| format!("reading {}", source_dir.display()))?;
            while let Some(entry) = inner.next_entry().await? {
                let path = entry.path();
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if entry.file_type().await?.is_file() && !hidden {
                    files.push(path);
                }
            }
            files.sort();
            if let Some(path) = files.pop() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("ts").with_timezone(&Utc)
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_exports_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let captured_at = ts("2026-02-24T12:00:00Z");

        let first = store
            .store_bytes(captured_at, "otp_portal", "json", b"[\"1.2.3.4\"]")
            .await
            .expect("first store");
        let second = store
            .store_bytes(captured_at, "otp_portal", "json", b"[\"1.2.3.4\"]")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn latest_artifact_picks_newest_capture() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store
            .store_bytes(ts("2026-01-01T00:00:00Z"), "otp_portal", "txt", b"1.1.1.1")
            .await
            .expect("old");
        let newest = store
            .store_bytes(ts("2026-03-01T00:00:00Z"), "otp_portal", "txt", b"9.9.9.9")
            .await
            .expect("new");
        store
            .store_bytes(ts("2026-04-01T00:00:00Z"), "other", "txt", b"5.5.5.5")
            .await
            .expect("other source");

        let latest = store.latest_artifact("otp_portal").await.expect("scan");
        assert_eq!(latest, Some(newest.absolute_path));
        assert_eq!(store.latest_artifact("missing").await.expect("scan"), None);
    }
}
