//! Deduplication Index
//!
//! Maps a fingerprint to its finished artifact. The artifact on disk is the
//! source of truth; the in-memory cache only saves metadata lookups.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::fragment_store::FragmentStore;
use super::types::{FileExtension, Fingerprint, StoredLocation, UploadError};

type CacheKey = (Fingerprint, FileExtension);

// ============================================================================
// Dedup Index
// ============================================================================

/// Fingerprint → artifact lookups
#[derive(Clone)]
pub struct DedupIndex {
    inner: Arc<DedupIndexInner>,
}

struct DedupIndexInner {
    store: FragmentStore,

    /// Artifacts confirmed to exist
    cache: RwLock<HashMap<CacheKey, StoredLocation>>,
}

impl DedupIndex {
    pub fn new(store: FragmentStore) -> Self {
        Self {
            inner: Arc::new(DedupIndexInner {
                store,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Find the finished artifact for a fingerprint, if any
    pub async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
    ) -> Result<Option<StoredLocation>, UploadError> {
        let key = (fingerprint.clone(), extension.clone());

        let cached = {
            let cache = self.inner.cache.read().await;
            cache.get(&key).cloned()
        };

        if let Some(location) = cached {
            // Confirm the file is still there before trusting the cache
            if self.inner.store.artifact_exists(fingerprint, extension).await? {
                tracing::debug!(fingerprint = %fingerprint, "Artifact found in cache");
                return Ok(Some(location));
            }

            tracing::warn!(fingerprint = %fingerprint, "Cached artifact missing from storage, evicting");
            self.inner.cache.write().await.remove(&key);
            return Ok(None);
        }

        let found = self.inner.store.artifact_location(fingerprint, extension).await?;
        if let Some(ref location) = found {
            self.inner.cache.write().await.insert(key, location.clone());
        }

        Ok(found)
    }

    /// Remember a freshly assembled artifact
    pub async fn record(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
        location: StoredLocation,
    ) {
        tracing::info!(
            fingerprint = %fingerprint,
            key = %location.key,
            size = location.size,
            "Registered artifact"
        );

        let mut cache = self.inner.cache.write().await;
        cache.insert((fingerprint.clone(), extension.clone()), location);
    }

    /// Load existing artifacts from storage into the cache
    pub async fn preload(&self) -> Result<usize, UploadError> {
        let dir = self.inner.store.artifacts_root();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(UploadError::StorageError(format!("{}: {}", dir.display(), e))),
        };

        let mut loaded = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?
        {
            let name = entry.file_name();
            let Some((fingerprint, extension)) = name.to_str().and_then(parse_artifact_name) else {
                continue;
            };

            let metadata = entry
                .metadata()
                .await
                .map_err(|e| UploadError::StorageError(e.to_string()))?;
            if !metadata.is_file() {
                continue;
            }

            let location = StoredLocation {
                key: FragmentStore::artifact_key(&fingerprint, &extension),
                size: metadata.len(),
            };
            loaded.push(((fingerprint, extension), location));
        }

        let count = loaded.len();
        let mut cache = self.inner.cache.write().await;
        cache.extend(loaded);

        tracing::info!(count = count, "Preloaded deduplication cache");
        Ok(count)
    }

    /// Clear the artifact cache
    pub async fn clear_cache(&self) {
        let mut cache = self.inner.cache.write().await;
        cache.clear();
        tracing::debug!("Cleared deduplication cache");
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.inner.cache.read().await;
        CacheStats {
            entries: cache.len(),
            cached_bytes: cache.values().map(|location| location.size).sum(),
        }
    }
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Statistics about the deduplication cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of known artifacts
    pub entries: usize,
    /// Total size of known artifacts
    pub cached_bytes: u64,
}

/// Split `<fingerprint>.<ext>`; hidden staging files do not parse
fn parse_artifact_name(name: &str) -> Option<(Fingerprint, FileExtension)> {
    let (fingerprint, extension) = name.rsplit_once('.')?;
    Some((
        Fingerprint::parse(fingerprint).ok()?,
        FileExtension::parse(extension).ok()?,
    ))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, FragmentStore, DedupIndex) {
        let temp_dir = TempDir::new().unwrap();
        let store = FragmentStore::with_local_storage(temp_dir.path().to_path_buf());
        store.init().await.unwrap();
        let index = DedupIndex::new(store.clone());
        (temp_dir, store, index)
    }

    #[tokio::test]
    async fn test_lookup_reflects_storage() {
        let (_dir, store, index) = setup().await;
        let fp = Fingerprint::parse("abc123").unwrap();
        let ext = FileExtension::parse("pdf").unwrap();

        assert!(index.lookup(&fp, &ext).await.unwrap().is_none());

        tokio::fs::write(store.artifact_path(&fp, &ext), b"0123456789").await.unwrap();
        let location = index.lookup(&fp, &ext).await.unwrap().unwrap();
        assert_eq!(location.key, "artifacts/abc123.pdf");
        assert_eq!(location.size, 10);

        // Different extension is a different artifact
        let other = FileExtension::parse("epub").unwrap();
        assert!(index.lookup(&fp, &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cached_entry_evicted_when_artifact_removed() {
        let (_dir, store, index) = setup().await;
        let fp = Fingerprint::parse("gone").unwrap();
        let ext = FileExtension::parse("bin").unwrap();

        let path = store.artifact_path(&fp, &ext);
        tokio::fs::write(&path, b"data").await.unwrap();
        index
            .record(&fp, &ext, StoredLocation { key: "artifacts/gone.bin".into(), size: 4 })
            .await;
        assert_eq!(index.cache_stats().await.entries, 1);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(index.lookup(&fp, &ext).await.unwrap().is_none());
        assert_eq!(index.cache_stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_preload_skips_staging_files() {
        let (_dir, store, index) = setup().await;
        let root = store.artifacts_root();
        tokio::fs::write(root.join("aaa.mp4"), b"12345").await.unwrap();
        tokio::fs::write(root.join("bbb.zip"), b"123").await.unwrap();
        tokio::fs::write(root.join(".ccc.bin.0f.part"), b"partial").await.unwrap();
        tokio::fs::write(root.join("noextension"), b"x").await.unwrap();

        assert_eq!(index.preload().await.unwrap(), 2);
        assert_eq!(
            index.cache_stats().await,
            CacheStats { entries: 2, cached_bytes: 8 }
        );

        index.clear_cache().await;
        assert_eq!(index.cache_stats().await.entries, 0);
    }

    #[test]
    fn test_parse_artifact_name() {
        let (fp, ext) = parse_artifact_name("abc.tar").unwrap();
        assert_eq!(fp.as_str(), "abc");
        assert_eq!(ext.as_str(), "tar");
        assert!(parse_artifact_name(".abc.tar.1234.part").is_none());
        assert!(parse_artifact_name("plain").is_none());
    }
}
