//! Fragment Store
//!
//! Local filesystem storage for uploaded fragments and finished artifacts.
//!
//! Layout under the upload root:
//! - `fragments/<fingerprint>/<index>` one file per fragment
//! - `artifacts/<fingerprint>.<ext>` the assembled file
//!
//! Entries starting with `.` are temp or staging files and never listed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::{
    FileExtension, Fingerprint, FragmentMetadata, PutOutcome, StoredFragment, StoredLocation,
    UploadError, ARTIFACTS_DIR, DEFAULT_MAX_FRAGMENT_SIZE, FRAGMENTS_DIR,
};

// ============================================================================
// Fragment Store
// ============================================================================

/// Fragment and artifact storage rooted at a local directory
#[derive(Clone)]
pub struct FragmentStore {
    inner: Arc<FragmentStoreInner>,
}

struct FragmentStoreInner {
    root: PathBuf,
    max_fragment_size: usize,
}

impl FragmentStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(root: PathBuf) -> Self {
        Self::with_max_fragment_size(root, DEFAULT_MAX_FRAGMENT_SIZE)
    }

    pub fn with_max_fragment_size(root: PathBuf, max_fragment_size: usize) -> Self {
        Self {
            inner: Arc::new(FragmentStoreInner {
                root,
                max_fragment_size,
            }),
        }
    }

    /// Create the fragment and artifact namespaces
    pub async fn init(&self) -> Result<(), UploadError> {
        for dir in [self.fragments_root(), self.artifacts_root()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| UploadError::StorageError(format!("{}: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn fragments_root(&self) -> PathBuf {
        self.inner.root.join(FRAGMENTS_DIR)
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.inner.root.join(ARTIFACTS_DIR)
    }

    pub fn fragment_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.fragments_root().join(fingerprint.as_str())
    }

    pub fn fragment_path(&self, fingerprint: &Fingerprint, index: usize) -> PathBuf {
        self.fragment_dir(fingerprint).join(index.to_string())
    }

    pub fn artifact_path(&self, fingerprint: &Fingerprint, extension: &FileExtension) -> PathBuf {
        self.artifacts_root().join(artifact_name(fingerprint, extension))
    }

    pub fn artifact_key(fingerprint: &Fingerprint, extension: &FileExtension) -> String {
        format!("{}/{}", ARTIFACTS_DIR, artifact_name(fingerprint, extension))
    }

    fn fragment_key(fingerprint: &Fingerprint, index: usize) -> String {
        format!("{}/{}/{}", FRAGMENTS_DIR, fingerprint, index)
    }

    /// Store a fragment, overwriting any previous upload of the same index.
    ///
    /// Returns `AlreadyComplete` without writing when the artifact exists.
    pub async fn put_fragment(
        &self,
        fingerprint: &Fingerprint,
        index: usize,
        extension: &FileExtension,
        data: &[u8],
    ) -> Result<PutOutcome, UploadError> {
        if data.len() > self.inner.max_fragment_size {
            return Err(UploadError::FragmentTooLarge {
                size: data.len(),
                max: self.inner.max_fragment_size,
            });
        }

        if let Some(location) = self.artifact_location(fingerprint, extension).await? {
            tracing::debug!(
                fingerprint = %fingerprint,
                fragment_index = index,
                "Artifact already exists, skipping fragment write"
            );
            return Ok(PutOutcome::AlreadyComplete(location));
        }

        let write_failed = |source: io::Error| UploadError::StorageWriteFailed {
            fingerprint: fingerprint.to_string(),
            fragment_index: index,
            source,
        };

        let dir = self.fragment_dir(fingerprint);
        tokio::fs::create_dir_all(&dir).await.map_err(write_failed)?;

        let path = self.fragment_path(fingerprint, index);
        let temp_path = dir.join(format!(".{}.{}.tmp", index, Uuid::new_v4()));

        if let Err(e) = write_atomically(&temp_path, &path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(write_failed(e));
        }

        tracing::debug!(
            fingerprint = %fingerprint,
            fragment_index = index,
            size = data.len(),
            "Fragment stored"
        );

        let size = data.len() as u64;
        Ok(PutOutcome::Stored {
            location: StoredLocation {
                key: Self::fragment_key(fingerprint, index),
                size,
            },
            metadata: FragmentMetadata {
                fingerprint: fingerprint.to_string(),
                fragment_index: index,
                fragment_extension: extension.to_string(),
                byte_size: size,
                stored_at: Utc::now(),
            },
        })
    }

    /// Indices of stored fragments in ascending numeric order
    pub async fn list_fragments(&self, fingerprint: &Fingerprint) -> Result<Vec<usize>, UploadError> {
        let entries = self.fragment_entries(fingerprint).await?;
        Ok(entries.into_iter().map(|entry| entry.index).collect())
    }

    /// Stored fragments with their sizes, sorted by numeric index
    pub async fn fragment_entries(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<StoredFragment>, UploadError> {
        let dir = self.fragment_dir(fingerprint);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::StorageError(format!("{}: {}", dir.display(), e))),
        };

        let mut fragments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_fragment_name) else {
                continue;
            };

            let metadata = entry
                .metadata()
                .await
                .map_err(|e| UploadError::StorageError(e.to_string()))?;
            if metadata.is_dir() {
                continue;
            }

            fragments.push(StoredFragment {
                index,
                path: entry.path(),
                size: metadata.len(),
            });
        }

        fragments.sort_by_key(|fragment| fragment.index);
        Ok(fragments)
    }

    /// Check whether the finished artifact exists
    pub async fn artifact_exists(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
    ) -> Result<bool, UploadError> {
        let path = self.artifact_path(fingerprint, extension);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| UploadError::StorageError(format!("{}: {}", path.display(), e)))
    }

    /// Location of the finished artifact, if it exists
    pub async fn artifact_location(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
    ) -> Result<Option<StoredLocation>, UploadError> {
        let path = self.artifact_path(fingerprint, extension);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(StoredLocation {
                key: Self::artifact_key(fingerprint, extension),
                size: metadata.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::StorageError(format!("{}: {}", path.display(), e))),
        }
    }

    /// Delete all fragments for a fingerprint. Returns the number removed.
    pub async fn delete_fragment_set(&self, fingerprint: &Fingerprint) -> Result<usize, UploadError> {
        let dir = self.fragment_dir(fingerprint);
        let count = self.fragment_entries(fingerprint).await?.len();

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(UploadError::StorageError(format!("{}: {}", dir.display(), e))),
        }

        tracing::debug!(fingerprint = %fingerprint, count = count, "Deleted fragment set");
        Ok(count)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn artifact_name(fingerprint: &Fingerprint, extension: &FileExtension) -> String {
    format!("{}.{}", fingerprint, extension)
}

/// Parse a fragment file name into its index.
///
/// Hidden entries and anything that is not the canonical decimal form of an
/// index (as written by `put_fragment`) are skipped, so no index is listed twice.
fn parse_fragment_name(name: &str) -> Option<usize> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if name.len() > 1 && name.starts_with('0') {
        return None;
    }
    name.parse().ok()
}

/// Write to a temp file, fsync, then rename over the final path
async fn write_atomically(temp_path: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    {
        let mut file = tokio::fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(temp_path, path).await
}

// ============================================================================
// Tests
// ============================================================================
