// ── File-backed cache ──
//
// One file per key under a root directory. Writes go to a uniquely named
// temp file that is fsynced and then renamed over the target, so a crash
// leaves either the old or the new value, never a torn one.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::KvCache;
use crate::error::CacheError;

const TEMP_SUFFIX: &str = ".tmp";

/// Durable cache stored as individual files.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open (creating if needed) a cache rooted at `root`.
    ///
    /// Leftover temp files from an interrupted write are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!(error = %e, path = %entry.path().display(), "could not remove stale temp file");
                }
            }
        }

        debug!(root = %root.display(), "opened file cache");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey { key: key.into() });
        }
        Ok(self.root.join(encode_key(key)))
    }
}

#[async_trait]
impl KvCache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let tmp = self
            .root
            .join(format!("{}.{}{TEMP_SUFFIX}", encode_key(key), Uuid::new_v4().simple()));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(value.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Encoded names never contain '.', so anything with one is a temp file.
            if name.contains('.') {
                continue;
            }
            if let Some(key) = decode_key(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ── Key encoding ─────────────────────────────────────────────────────

/// Percent-encode everything except ASCII alphanumerics, `-` and `_`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes.get(i) == Some(&b'%') {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(*bytes.get(i)?);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_roundtrips() {
        for key in ["queue/lock:hub-1", "snapshot/Front Door", "a.b", "ünïcode/key", "plain"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('/'));
            assert!(!encoded.contains('.'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[test]
    fn malformed_names_do_not_decode() {
        assert!(decode_key("abc%2").is_none());
        assert!(decode_key("abc%zz").is_none());
    }

    #[tokio::test]
    async fn values_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = FileCache::open(dir.path()).await.unwrap();
            cache.set("queue/lock:hub-1", "{\"a\":1}".into()).await.unwrap();
            cache.set("snapshot/hub-1", "{}".into()).await.unwrap();
        }

        let cache = FileCache::open(dir.path()).await.unwrap();
        assert_eq!(
            cache.get("queue/lock:hub-1").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(
            cache.list_keys("queue/").await.unwrap(),
            vec!["queue/lock:hub-1".to_owned()]
        );
    }

    #[tokio::test]
    async fn overwrite_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();

        cache.set("k", "one".into()).await.unwrap();
        cache.set("k", "two".into()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("two"));

        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_temp_files_are_ignored_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("queue%2Fx.abc.tmp"), "partial").unwrap();

        let cache = FileCache::open(dir.path()).await.unwrap();
        assert!(cache.list_keys("").await.unwrap().is_empty());
        assert!(!dir.path().join("queue%2Fx.abc.tmp").exists());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();
        assert!(matches!(
            cache.set("", "x".into()).await,
            Err(CacheError::InvalidKey { .. })
        ));
    }
}
