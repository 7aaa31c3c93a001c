//! Assembly Coordinator
//!
//! Merges a complete fragment set into its artifact.
//!
//! Each fragment is copied to the fixed offset `index * chunk_size` of a
//! hidden staging file, so writers never overlap and may run in parallel.
//! The staging file only becomes visible under the artifact name through a
//! hard link, which fails if the artifact already exists.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use super::fragment_store::FragmentStore;
use super::lock::AssemblyLocks;
use super::types::{
    AssemblyOutcome, FileExtension, Fingerprint, ReadinessReport, StoredFragment, StoredLocation,
    UploadError, DEFAULT_MERGE_PARALLELISM, MAX_REPORTED_MISSING,
};

/// Read buffer for fingerprint verification
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Assembly options
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Maximum fragments copied concurrently within one assembly
    pub merge_parallelism: usize,

    /// Recompute SHA-256 of the merged bytes and require it to equal the
    /// fingerprint
    pub verify_fingerprint: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            merge_parallelism: DEFAULT_MERGE_PARALLELISM,
            verify_fingerprint: false,
        }
    }
}

// ============================================================================
// Assembly Coordinator
// ============================================================================

/// Serializes and performs fragment merges
#[derive(Clone)]
pub struct AssemblyCoordinator {
    inner: Arc<AssemblyCoordinatorInner>,
}

struct AssemblyCoordinatorInner {
    store: FragmentStore,
    locks: AssemblyLocks,
    config: AssemblyConfig,
}

impl AssemblyCoordinator {
    pub fn new(store: FragmentStore, config: AssemblyConfig) -> Self {
        Self {
            inner: Arc::new(AssemblyCoordinatorInner {
                store,
                locks: AssemblyLocks::new(),
                config,
            }),
        }
    }

    pub fn store(&self) -> &FragmentStore {
        &self.inner.store
    }

    pub fn locks(&self) -> &AssemblyLocks {
        &self.inner.locks
    }

    /// Compare stored fragments against `0..expected_count`
    pub async fn check_ready(
        &self,
        fingerprint: &Fingerprint,
        expected_count: usize,
    ) -> Result<ReadinessReport, UploadError> {
        let present = self.inner.store.list_fragments(fingerprint).await?;
        Ok(readiness(&present, expected_count))
    }

    /// Merge all fragments of `fingerprint` into `<fingerprint>.<extension>`.
    ///
    /// `chunk_size` is the nominal fragment size; when absent it is taken from
    /// fragment 0. Fails fast with `AssemblyInProgress` if another merge for
    /// the same fingerprint is running.
    pub async fn assemble(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
        total_size: u64,
        chunk_size: Option<u64>,
    ) -> Result<AssemblyOutcome, UploadError> {
        let store = &self.inner.store;

        if let Some(location) = store.artifact_location(fingerprint, extension).await? {
            return Ok(AssemblyOutcome::AlreadyMerged(location));
        }

        let _lock = self
            .inner
            .locks
            .try_acquire(fingerprint)
            .ok_or_else(|| UploadError::AssemblyInProgress(fingerprint.to_string()))?;

        // A merge may have committed between the check above and the lock
        if let Some(location) = store.artifact_location(fingerprint, extension).await? {
            return Ok(AssemblyOutcome::AlreadyMerged(location));
        }

        let fragments = store.fragment_entries(fingerprint).await?;
        let plan = plan_merge(fingerprint, fragments, total_size, chunk_size)?;

        tracing::info!(
            fingerprint = %fingerprint,
            extension = %extension,
            fragments = plan.fragments.len(),
            total_size = plan.total_size,
            chunk_size = plan.chunk_size,
            "Assembling artifact from fragments"
        );

        // Declared after the lock so it is removed before the lock is freed
        let staging = StagingFile::create(&store.artifacts_root(), fingerprint, extension, total_size)
            .await
            .map_err(|source| merge_failed(fingerprint, source))?;

        let committed = self.stage_and_commit(fingerprint, extension, &plan, &staging).await;
        staging.remove().await;

        let outcome = match committed {
            Ok(outcome @ AssemblyOutcome::Merged(_)) => outcome,
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                tracing::warn!(fingerprint = %fingerprint, error = %err, "Assembly aborted");
                return Err(err);
            }
        };

        // The artifact is complete; leftover fragments only waste space
        if let Err(e) = store.delete_fragment_set(fingerprint).await {
            tracing::warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Failed to delete fragments after merge"
            );
        }

        tracing::info!(
            fingerprint = %fingerprint,
            size = total_size,
            key = %outcome.location().key,
            "Artifact assembled"
        );

        Ok(outcome)
    }

    /// Fill the staging file, verify it and publish it under the artifact name
    async fn stage_and_commit(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
        plan: &MergePlan,
        staging: &StagingFile,
    ) -> Result<AssemblyOutcome, UploadError> {
        let store = &self.inner.store;

        self.write_fragments(fingerprint, plan, staging.path()).await?;
        staging
            .sync()
            .await
            .map_err(|source| merge_failed(fingerprint, source))?;

        if self.inner.config.verify_fingerprint {
            let actual = digest_file(staging.path())
                .await
                .map_err(|source| merge_failed(fingerprint, source))?;
            if !actual.eq_ignore_ascii_case(fingerprint.as_str()) {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    actual = %actual,
                    "Merged content does not match fingerprint"
                );
                return Err(UploadError::FingerprintMismatch {
                    expected: fingerprint.to_string(),
                    actual,
                });
            }
        }

        let artifact_path = store.artifact_path(fingerprint, extension);
        match staging.commit(&artifact_path).await {
            Ok(()) => Ok(AssemblyOutcome::Merged(StoredLocation {
                key: FragmentStore::artifact_key(fingerprint, extension),
                size: plan.total_size,
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(fingerprint = %fingerprint, "Artifact appeared during assembly");
                let location = store
                    .artifact_location(fingerprint, extension)
                    .await?
                    .ok_or_else(|| UploadError::StorageError("artifact vanished after commit race".into()))?;
                Ok(AssemblyOutcome::AlreadyMerged(location))
            }
            Err(e) => Err(merge_failed(fingerprint, e)),
        }
    }

    /// Copy every fragment to its offset with bounded parallelism
    async fn write_fragments(
        &self,
        fingerprint: &Fingerprint,
        plan: &MergePlan,
        staging: &Path,
    ) -> Result<(), UploadError> {
        let parallelism = self.inner.config.merge_parallelism.max(1);

        // Each copy owns its inputs so the stream stays `Send`
        let copies: Vec<_> = plan
            .fragments
            .iter()
            .cloned()
            .map(|fragment| {
                let fingerprint = fingerprint.to_string();
                let staging = staging.to_path_buf();
                let offset = fragment.index as u64 * plan.chunk_size;
                async move {
                    copy_fragment_at(&fragment, &staging, offset)
                        .await
                        .map_err(|source| UploadError::AssemblyFailed {
                            fingerprint,
                            stage: format!("fragment {}", fragment.index),
                            source,
                        })
                }
            })
            .collect();

        futures::stream::iter(copies)
            .buffer_unordered(parallelism)
            .try_collect::<Vec<()>>()
            .await?;

        Ok(())
    }
}

// ============================================================================
// Merge Planning
// ============================================================================

/// Validated fragment layout for one merge
#[derive(Debug)]
struct MergePlan {
    chunk_size: u64,
    total_size: u64,
    fragments: Vec<StoredFragment>,
}

/// Gaps in `present` over `0..expected_count`.
///
/// `present` must be sorted and free of duplicates. Work is bounded by the
/// number of present fragments plus `MAX_REPORTED_MISSING`, never by
/// `expected_count`.
fn readiness(present: &[usize], expected_count: usize) -> ReadinessReport {
    let covered = present.iter().filter(|&&index| index < expected_count).count();
    let missing_count = expected_count.saturating_sub(covered);

    let mut missing_indices = Vec::with_capacity(missing_count.min(MAX_REPORTED_MISSING));
    let mut next_present = present.iter().copied().peekable();
    let mut index = 0;
    while index < expected_count && missing_indices.len() < MAX_REPORTED_MISSING {
        if next_present.peek() == Some(&index) {
            next_present.next();
        } else {
            missing_indices.push(index);
        }
        index += 1;
    }

    ReadinessReport {
        complete: missing_count == 0,
        missing_indices,
        missing_count,
    }
}

/// Derive the expected layout and check the stored fragments against it.
///
/// `fragments` must be sorted by index.
fn plan_merge(
    fingerprint: &Fingerprint,
    fragments: Vec<StoredFragment>,
    total_size: u64,
    chunk_size: Option<u64>,
) -> Result<MergePlan, UploadError> {
    let mismatch = |detail: String| UploadError::LayoutMismatch {
        fingerprint: fingerprint.to_string(),
        detail,
    };

    if total_size == 0 {
        log_stray(fingerprint, &fragments, 0);
        return Ok(MergePlan {
            chunk_size: chunk_size.unwrap_or(0),
            total_size,
            fragments: Vec::new(),
        });
    }

    let present: Vec<usize> = fragments.iter().map(|f| f.index).collect();

    let first_size = fragments.first().filter(|f| f.index == 0).map(|f| f.size);
    let Some(chunk_size) = chunk_size.or(first_size) else {
        // Without fragment 0 the count is unknown; report the gaps seen so far
        let seen = present.last().map_or(1, |last| last.saturating_add(1));
        return Err(UploadError::IncompleteUpload {
            fingerprint: fingerprint.to_string(),
            missing: readiness(&present, seen).missing_indices,
        });
    };

    if chunk_size == 0 {
        return Err(mismatch("chunk size is zero".to_string()));
    }

    let expected_count = usize::try_from(total_size.div_ceil(chunk_size))
        .map_err(|_| mismatch(format!("{} fragments exceed addressable range", total_size.div_ceil(chunk_size))))?;

    let report = readiness(&present, expected_count);
    if !report.complete {
        return Err(UploadError::IncompleteUpload {
            fingerprint: fingerprint.to_string(),
            missing: report.missing_indices,
        });
    }

    // Leftovers from an earlier layout; removed with the set after the merge
    log_stray(fingerprint, &fragments, expected_count);
    let fragments: Vec<StoredFragment> = fragments
        .into_iter()
        .filter(|f| f.index < expected_count)
        .collect();

    let last_index = expected_count - 1;
    let last_size = total_size - chunk_size * last_index as u64;
    for fragment in &fragments {
        let expected = if fragment.index == last_index {
            last_size
        } else {
            chunk_size
        };
        if fragment.size != expected {
            return Err(mismatch(format!(
                "fragment {} has {} bytes, expected {}",
                fragment.index, fragment.size, expected
            )));
        }
    }

    Ok(MergePlan {
        chunk_size,
        total_size,
        fragments,
    })
}

fn log_stray(fingerprint: &Fingerprint, fragments: &[StoredFragment], expected_count: usize) {
    let stray = fragments.iter().filter(|f| f.index >= expected_count).count();
    if stray > 0 {
        tracing::warn!(
            fingerprint = %fingerprint,
            stray = stray,
            expected_count = expected_count,
            "Ignoring fragments beyond the expected count"
        );
    }
}

// ============================================================================
// Staging File
// ============================================================================

/// Hidden file an artifact is merged into before it is published.
///
/// Callers remove it with [`StagingFile::remove`]; dropping it without that,
/// as on cancellation, removes it synchronously.
struct StagingFile {
    path: PathBuf,
    removed: bool,
}

impl StagingFile {
    async fn create(
        dir: &Path,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
        len: u64,
    ) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!(".{}.{}.{}.part", fingerprint, extension, Uuid::new_v4()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let staging = Self {
            path,
            removed: false,
        };

        file.set_len(len).await?;
        Ok(staging)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn sync(&self) -> io::Result<()> {
        let file = tokio::fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.sync_all().await
    }

    /// Publish under `dest`; fails with `AlreadyExists` if `dest` exists
    async fn commit(&self, dest: &Path) -> io::Result<()> {
        tokio::fs::hard_link(&self.path, dest).await
    }

    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
            }
        }
        self.removed = true;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn merge_failed(fingerprint: &Fingerprint, source: io::Error) -> UploadError {
    UploadError::AssemblyFailed {
        fingerprint: fingerprint.to_string(),
        stage: "merge".to_string(),
        source,
    }
}

async fn copy_fragment_at(fragment: &StoredFragment, dest: &Path, offset: u64) -> io::Result<()> {
    let mut reader = tokio::fs::File::open(&fragment.path).await?;
    let mut writer = tokio::fs::OpenOptions::new().write(true).open(dest).await?;
    writer.seek(SeekFrom::Start(offset)).await?;

    let written = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;

    if written != fragment.size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "fragment {} changed during merge: copied {} bytes, expected {}",
                fragment.index, written, fragment.size
            ),
        ));
    }
    Ok(())
}

/// Hex SHA-256 of a file
async fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(config: AssemblyConfig) -> (TempDir, AssemblyCoordinator) {
        let temp_dir = TempDir::new().unwrap();
        let store = FragmentStore::with_local_storage(temp_dir.path().to_path_buf());
        (temp_dir, AssemblyCoordinator::new(store, config))
    }

    fn fp(raw: &str) -> Fingerprint {
        Fingerprint::parse(raw).unwrap()
    }

    fn ext() -> FileExtension {
        FileExtension::parse("bin").unwrap()
    }

    /// Deterministic content split into `chunk`-sized fragments
    fn content(len: usize, chunk: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let fragments = data.chunks(chunk).map(|c| c.to_vec()).collect();
        (data, fragments)
    }

    async fn upload(coordinator: &AssemblyCoordinator, fp: &Fingerprint, fragments: &[Vec<u8>], order: &[usize]) {
        for &index in order {
            coordinator
                .store()
                .put_fragment(fp, index, &ext(), &fragments[index])
                .await
                .unwrap();
        }
    }

    async fn hidden_entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                names.push(name);
            }
        }
        names
    }

    #[tokio::test]
    async fn test_out_of_order_upload_scenario() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("scenario25");
        let (data, fragments) = content(25, 10);
        assert_eq!(fragments.iter().map(Vec::len).collect::<Vec<_>>(), vec![10, 10, 5]);

        upload(&coordinator, &fp, &fragments, &[1, 0]).await;

        let report = coordinator.check_ready(&fp, 3).await.unwrap();
        assert!(!report.complete);
        assert_eq!(report.missing_indices, vec![2]);

        let early = coordinator.assemble(&fp, &ext(), 25, None).await;
        assert!(matches!(early, Err(UploadError::IncompleteUpload { ref missing, .. }) if missing == &vec![2]));

        upload(&coordinator, &fp, &fragments, &[2]).await;
        assert!(coordinator.check_ready(&fp, 3).await.unwrap().complete);

        let outcome = coordinator.assemble(&fp, &ext(), 25, None).await.unwrap();
        assert!(matches!(outcome, AssemblyOutcome::Merged(_)));
        assert_eq!(outcome.location().size, 25);

        let merged = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
        assert_eq!(merged, data);

        // Fragment set is consumed
        assert!(coordinator.store().list_fragments(&fp).await.unwrap().is_empty());
        assert!(hidden_entries(&coordinator.store().artifacts_root()).await.is_empty());
        assert!(!coordinator.locks().is_held(&fp));
    }

    #[tokio::test]
    async fn test_numeric_order_beyond_nine_fragments() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("elevenparts");

        // Each fragment is its own index repeated, so misordering is visible
        let fragments: Vec<Vec<u8>> = (0..=10u8).map(|i| vec![i; 4]).collect();
        let order: Vec<usize> = (0..=10).rev().collect();
        upload(&coordinator, &fp, &fragments, &order).await;

        coordinator.assemble(&fp, &ext(), 44, Some(4)).await.unwrap();

        let merged = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
        let expected: Vec<u8> = fragments.concat();
        assert_eq!(merged, expected);
        assert_eq!(&merged[40..44], &[10, 10, 10, 10]);
    }

    #[tokio::test]
    async fn test_upload_order_does_not_change_artifact() {
        let (data, fragments) = content(1000, 64);
        let count = fragments.len();

        let in_order: Vec<usize> = (0..count).collect();
        let reversed: Vec<usize> = (0..count).rev().collect();
        let interleaved: Vec<usize> = (0..count).filter(|i| i % 2 == 1).chain((0..count).filter(|i| i % 2 == 0)).collect();

        for order in [in_order, reversed, interleaved] {
            let (_dir, coordinator) = setup(AssemblyConfig {
                merge_parallelism: 3,
                verify_fingerprint: false,
            });
            let fp = fp("permutation");
            upload(&coordinator, &fp, &fragments, &order).await;

            coordinator.assemble(&fp, &ext(), 1000, None).await.unwrap();

            let merged = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
            assert_eq!(merged, data, "order {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_assemble_existing_artifact_is_noop() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("twice");
        let (_, fragments) = content(30, 10);
        upload(&coordinator, &fp, &fragments, &[0, 1, 2]).await;

        let first = coordinator.assemble(&fp, &ext(), 30, None).await.unwrap();
        assert!(matches!(first, AssemblyOutcome::Merged(_)));

        let second = coordinator.assemble(&fp, &ext(), 30, None).await.unwrap();
        assert!(matches!(second, AssemblyOutcome::AlreadyMerged(ref loc) if loc.size == 30));
        assert!(!coordinator.store().fragment_dir(&fp).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_merges_run_once() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("contended");
        let (data, fragments) = content(4096, 256);
        let order: Vec<usize> = (0..fragments.len()).collect();
        upload(&coordinator, &fp, &fragments, &order).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let fp = fp.clone();
                tokio::spawn(async move { coordinator.assemble(&fp, &ext(), 4096, None).await })
            })
            .collect();

        let mut merged = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(AssemblyOutcome::Merged(_)) => merged += 1,
                Ok(AssemblyOutcome::AlreadyMerged(_)) => {}
                Err(UploadError::AssemblyInProgress(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(merged, 1);

        let artifact = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
        assert_eq!(artifact, data);
    }

    #[tokio::test]
    async fn test_in_progress_when_lock_held() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("busy");
        let (_, fragments) = content(10, 10);
        upload(&coordinator, &fp, &fragments, &[0]).await;

        let guard = coordinator.locks().try_acquire(&fp).unwrap();
        let result = coordinator.assemble(&fp, &ext(), 10, None).await;
        assert!(matches!(result, Err(UploadError::AssemblyInProgress(_))));

        drop(guard);
        assert!(coordinator.assemble(&fp, &ext(), 10, None).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_fragment_leaves_no_artifact() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("brokenmerge");
        let (data, fragments) = content(25, 10);
        upload(&coordinator, &fp, &fragments, &[0, 1, 2]).await;

        // Swap fragment 2 for a dangling link whose own length matches the
        // expected 5 bytes, so planning passes and the copy fails
        let fragment_path = coordinator.store().fragment_path(&fp, 2);
        tokio::fs::remove_file(&fragment_path).await.unwrap();
        tokio::fs::symlink("/nope", &fragment_path).await.unwrap();

        let result = coordinator.assemble(&fp, &ext(), 25, None).await;
        match result {
            Err(UploadError::AssemblyFailed { stage, .. }) => assert_eq!(stage, "fragment 2"),
            other => panic!("expected AssemblyFailed, got {:?}", other),
        }

        let artifacts_root = coordinator.store().artifacts_root();
        assert!(!coordinator.store().artifact_path(&fp, &ext()).exists());
        assert!(hidden_entries(&artifacts_root).await.is_empty());
        assert!(!coordinator.locks().is_held(&fp));
        assert_eq!(coordinator.store().list_fragments(&fp).await.unwrap(), vec![0, 1, 2]);

        // Repair storage and retry
        tokio::fs::remove_file(&fragment_path).await.unwrap();
        upload(&coordinator, &fp, &fragments, &[2]).await;

        let outcome = coordinator.assemble(&fp, &ext(), 25, None).await.unwrap();
        assert!(matches!(outcome, AssemblyOutcome::Merged(_)));
        let merged = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
        assert_eq!(merged, data);
    }

    #[tokio::test]
    async fn test_wrong_fragment_size_is_rejected() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("shortmiddle");
        let fragments = vec![vec![1u8; 10], vec![2u8; 9], vec![3u8; 5]];
        upload(&coordinator, &fp, &fragments, &[0, 1, 2]).await;

        let result = coordinator.assemble(&fp, &ext(), 25, None).await;
        assert!(matches!(result, Err(UploadError::LayoutMismatch { .. })));
        assert!(!coordinator.store().artifact_path(&fp, &ext()).exists());
    }

    #[tokio::test]
    async fn test_empty_file_assembles_without_fragments() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("emptyfile");

        let outcome = coordinator.assemble(&fp, &ext(), 0, None).await.unwrap();
        assert_eq!(outcome.location().size, 0);
        let merged = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn test_fingerprint_verification() {
        let (_dir, coordinator) = setup(AssemblyConfig {
            merge_parallelism: 2,
            verify_fingerprint: true,
        });
        let (data, fragments) = content(50, 16);
        let order: Vec<usize> = (0..fragments.len()).collect();

        let good = fp(&hex::encode(Sha256::digest(&data)));
        upload(&coordinator, &good, &fragments, &order).await;
        let outcome = coordinator.assemble(&good, &ext(), 50, None).await.unwrap();
        assert!(matches!(outcome, AssemblyOutcome::Merged(_)));

        let bad = fp("deadbeef");
        upload(&coordinator, &bad, &fragments, &order).await;
        let result = coordinator.assemble(&bad, &ext(), 50, None).await;
        assert!(matches!(result, Err(UploadError::FingerprintMismatch { .. })));
        assert!(!coordinator.store().artifact_path(&bad, &ext()).exists());
        assert!(hidden_entries(&coordinator.store().artifacts_root()).await.is_empty());
    }

    #[tokio::test]
    async fn test_staging_file_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingFile::create(temp_dir.path(), &fp("cancelled"), &ext(), 128)
            .await
            .unwrap();
        let path = staging.path().to_path_buf();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 128);

        drop(staging);
        assert!(!path.exists());
    }

    #[test]
    fn test_plan_without_first_fragment_reports_gaps() {
        let fp = fp("nofirst");
        let fragments = vec![StoredFragment {
            index: 3,
            path: PathBuf::from("3"),
            size: 10,
        }];

        let result = plan_merge(&fp, fragments, 100, None);
        match result {
            Err(UploadError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![0, 1, 2]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_plan_ignores_stray_fragment() {
        let fp = fp("stray");
        let fragments = (0..4)
            .map(|index| StoredFragment {
                index,
                path: PathBuf::from(index.to_string()),
                size: 10,
            })
            .collect();

        let plan = plan_merge(&fp, fragments, 30, Some(10)).unwrap();
        assert_eq!(plan.fragments.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_plan_for_huge_claimed_size_is_bounded() {
        let fp = fp("tinyupload");
        let fragments = vec![StoredFragment {
            index: 0,
            path: PathBuf::from("0"),
            size: 1,
        }];

        let result = plan_merge(&fp, fragments, 1 << 40, None);
        match result {
            Err(UploadError::IncompleteUpload { missing, .. }) => {
                assert_eq!(missing.len(), MAX_REPORTED_MISSING);
                assert_eq!(missing[0], 1);
                assert_eq!(missing[MAX_REPORTED_MISSING - 1], MAX_REPORTED_MISSING);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_readiness_counts_every_gap_but_lists_the_lowest() {
        let report = readiness(&[0, 5, 7], 3_000_000);
        assert!(!report.complete);
        assert_eq!(report.missing_count, 3_000_000 - 3);
        assert_eq!(report.missing_indices.len(), MAX_REPORTED_MISSING);
        assert_eq!(&report.missing_indices[..5], &[1, 2, 3, 4, 6]);

        let done = readiness(&[0, 1, 2, 9], 3);
        assert!(done.complete);
        assert_eq!(done.missing_count, 0);
        assert!(done.missing_indices.is_empty());
    }

    #[tokio::test]
    async fn test_stray_fragment_does_not_block_merge() {
        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("retriedsender");
        let (data, fragments) = content(25, 10);
        upload(&coordinator, &fp, &fragments, &[0, 1, 2]).await;
        coordinator
            .store()
            .put_fragment(&fp, 3, &ext(), b"extra")
            .await
            .unwrap();

        let outcome = coordinator.assemble(&fp, &ext(), 25, None).await.unwrap();
        assert!(matches!(outcome, AssemblyOutcome::Merged(_)));

        let merged = tokio::fs::read(coordinator.store().artifact_path(&fp, &ext())).await.unwrap();
        assert_eq!(merged, data);
        assert!(!coordinator.store().fragment_dir(&fp).exists());
    }

    #[test]
    fn test_assemble_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (_dir, coordinator) = setup(AssemblyConfig::default());
        let fp = fp("sendable");
        let ext = ext();
        let future = coordinator.assemble(&fp, &ext, 10, None);
        assert_send(&future);
    }

    #[tokio::test]
    async fn test_staging_file_removed_explicitly() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingFile::create(temp_dir.path(), &fp("finished"), &ext(), 16)
            .await
            .unwrap();
        let path = staging.path().to_path_buf();

        staging.remove().await;
        assert!(!path.exists());
        assert!(hidden_entries(temp_dir.path()).await.is_empty());
    }
}
