//! Upload Intake
//!
//! The boundary the HTTP layer talks to: check, upload fragment, merge.
//! Transient merge states are reported as statuses, not errors.

use super::assembly::{AssemblyConfig, AssemblyCoordinator};
use super::deduplication::DedupIndex;
use super::fragment_store::FragmentStore;
use super::types::{
    AssemblyOutcome, CheckUploadResponse, FileExtension, Fingerprint, FragmentStatus,
    MergeResponse, MergeStatus, PutOutcome, StoredLocation, UploadError, UploadFragmentResponse,
};

/// Upload intake service
#[derive(Clone)]
pub struct UploadService {
    store: FragmentStore,
    coordinator: AssemblyCoordinator,
    dedup: DedupIndex,
}

impl UploadService {
    pub fn new(store: FragmentStore, config: AssemblyConfig) -> Self {
        let coordinator = AssemblyCoordinator::new(store.clone(), config);
        let dedup = DedupIndex::new(store.clone());

        Self {
            store,
            coordinator,
            dedup,
        }
    }

    pub fn store(&self) -> &FragmentStore {
        &self.store
    }

    pub fn coordinator(&self) -> &AssemblyCoordinator {
        &self.coordinator
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    /// Report whether the file is complete, or which fragments already arrived
    pub async fn check_upload(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
    ) -> Result<CheckUploadResponse, UploadError> {
        if let Some(location) = self.dedup.lookup(fingerprint, extension).await? {
            tracing::info!(
                fingerprint = %fingerprint,
                "Duplicate file detected - instant upload"
            );
            return Ok(CheckUploadResponse {
                uploaded: true,
                uploaded_fragment_indices: Vec::new(),
                location: Some(location),
            });
        }

        let uploaded_fragment_indices = self.store.list_fragments(fingerprint).await?;

        tracing::debug!(
            fingerprint = %fingerprint,
            uploaded_fragments = uploaded_fragment_indices.len(),
            "Upload check complete"
        );

        Ok(CheckUploadResponse {
            uploaded: false,
            uploaded_fragment_indices,
            location: None,
        })
    }

    /// Store one fragment
    pub async fn upload_fragment(
        &self,
        fingerprint: &Fingerprint,
        fragment_index: usize,
        extension: &FileExtension,
        data: &[u8],
    ) -> Result<UploadFragmentResponse, UploadError> {
        match self
            .store
            .put_fragment(fingerprint, fragment_index, extension, data)
            .await?
        {
            PutOutcome::Stored { location, .. } => Ok(UploadFragmentResponse {
                status: FragmentStatus::Stored,
                location,
            }),
            PutOutcome::AlreadyComplete(location) => Ok(UploadFragmentResponse {
                status: FragmentStatus::AlreadyComplete,
                location,
            }),
        }
    }

    /// Assemble the file if every fragment is present
    pub async fn request_merge(
        &self,
        fingerprint: &Fingerprint,
        extension: &FileExtension,
        total_size: u64,
        chunk_size: Option<u64>,
    ) -> Result<MergeResponse, UploadError> {
        let result = self
            .coordinator
            .assemble(fingerprint, extension, total_size, chunk_size)
            .await;

        match result {
            Ok(AssemblyOutcome::Merged(location)) => {
                self.dedup
                    .record(fingerprint, extension, location.clone())
                    .await;
                Ok(merged(location))
            }
            Ok(AssemblyOutcome::AlreadyMerged(location)) => Ok(merged(location)),
            Err(UploadError::IncompleteUpload { missing, .. }) => {
                tracing::debug!(
                    fingerprint = %fingerprint,
                    missing = missing.len(),
                    "Merge requested before all fragments arrived"
                );
                Ok(MergeResponse {
                    status: MergeStatus::Incomplete,
                    location: None,
                    missing_indices: missing,
                })
            }
            Err(UploadError::AssemblyInProgress(_)) => Ok(MergeResponse {
                status: MergeStatus::InProgress,
                location: None,
                missing_indices: Vec::new(),
            }),
            Err(e) => {
                tracing::error!(fingerprint = %fingerprint, error = %e, "Merge failed");
                Err(e)
            }
        }
    }
}

fn merged(location: StoredLocation) -> MergeResponse {
    MergeResponse {
        status: MergeStatus::Merged,
        location: Some(location),
        missing_indices: Vec::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================
