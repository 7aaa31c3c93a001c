//! Upload types for fragment intake and assembly

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default maximum fragment size: 64MB
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Default number of fragment writers per assembly
pub const DEFAULT_MERGE_PARALLELISM: usize = 4;

/// Maximum fingerprint length in characters
pub const MAX_FINGERPRINT_LEN: usize = 128;

/// Maximum extension length in characters
pub const MAX_EXTENSION_LEN: usize = 32;

/// Longest missing-index list reported for an incomplete upload
pub const MAX_REPORTED_MISSING: usize = 1000;

/// Namespace holding one directory of fragments per fingerprint
pub const FRAGMENTS_DIR: &str = "fragments";

/// Namespace holding finished artifacts
pub const ARTIFACTS_DIR: &str = "artifacts";

// ============================================================================
// Identifiers
// ============================================================================

/// Client-computed content fingerprint of a complete file.
///
/// Restricted to `[A-Za-z0-9_-]` so it can be used directly as a path
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_FINGERPRINT_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        if !valid {
            return Err(UploadError::InvalidFingerprint(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extension of the assembled artifact (without the leading dot)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_EXTENSION_LEN
            && raw.bytes().all(|b| b.is_ascii_alphanumeric());

        if !valid {
            return Err(UploadError::InvalidExtension(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Storage Types
// ============================================================================

/// Where a fragment or artifact lives, relative to the upload root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredLocation {
    /// Storage key, e.g. `artifacts/<fingerprint>.<ext>`
    pub key: String,

    /// Size in bytes
    pub size: u64,
}

/// Metadata for a stored fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMetadata {
    pub fingerprint: String,
    pub fragment_index: usize,
    pub fragment_extension: String,
    pub byte_size: u64,
    pub stored_at: DateTime<Utc>,
}

/// A fragment as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFragment {
    pub index: usize,
    pub path: PathBuf,
    pub size: u64,
}

/// Result of writing a fragment
#[derive(Debug, Clone)]
pub enum PutOutcome {
    /// Fragment bytes were written
    Stored {
        location: StoredLocation,
        metadata: FragmentMetadata,
    },
    /// The artifact already exists; nothing was written
    AlreadyComplete(StoredLocation),
}

// ============================================================================
// Assembly Types
// ============================================================================

/// Readiness of a fragment set for assembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub complete: bool,

    /// Lowest missing indices, at most `MAX_REPORTED_MISSING`
    pub missing_indices: Vec<usize>,

    pub missing_count: usize,
}

/// Successful result of an assembly request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// This call ran the merge
    Merged(StoredLocation),
    /// The artifact already existed; no merge was run
    AlreadyMerged(StoredLocation),
}

impl AssemblyOutcome {
    pub fn location(&self) -> &StoredLocation {
        match self {
            Self::Merged(location) | Self::AlreadyMerged(location) => location,
        }
    }
}

// ============================================================================
// Intake Types
// ============================================================================

/// Response to an upload check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUploadResponse {
    /// Whether the complete artifact already exists
    pub uploaded: bool,

    /// Fragment indices already stored (empty when `uploaded`)
    pub uploaded_fragment_indices: Vec<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<StoredLocation>,
}

/// Status of a fragment upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FragmentStatus {
    Stored,
    AlreadyComplete,
}

/// Response after uploading a fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFragmentResponse {
    pub status: FragmentStatus,
    pub location: StoredLocation,
}

/// Status of a merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStatus {
    Merged,
    Incomplete,
    InProgress,
}

/// Response to a merge request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub status: MergeStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<StoredLocation>,

    /// Lowest fragments still missing (only for `incomplete`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_indices: Vec<usize>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid fingerprint: {0:?}")]
    InvalidFingerprint(String),

    #[error("Invalid extension: {0:?}")]
    InvalidExtension(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Fragment too large: {size} bytes (max: {max})")]
    FragmentTooLarge { size: usize, max: usize },

    #[error("Upload {fingerprint} incomplete, missing fragments: {missing:?}")]
    IncompleteUpload {
        fingerprint: String,
        missing: Vec<usize>,
    },

    #[error("Assembly already in progress for {0}")]
    AssemblyInProgress(String),

    #[error("Fragment layout mismatch for {fingerprint}: {detail}")]
    LayoutMismatch { fingerprint: String, detail: String },

    #[error("Assembly failed for {fingerprint} ({stage}): {source}")]
    AssemblyFailed {
        fingerprint: String,
        /// `fragment <n>` or `merge`
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to store fragment {fragment_index} of {fingerprint}: {source}")]
    StorageWriteFailed {
        fingerprint: String,
        fragment_index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Storage error: {0}")]
    StorageError(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidFingerprint(_) => StatusCode::BAD_REQUEST,
            Self::InvalidExtension(_) => StatusCode::BAD_REQUEST,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::FragmentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::AssemblyInProgress(_) => StatusCode::CONFLICT,
            Self::LayoutMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AssemblyFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageWriteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::FingerprintMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFingerprint(_) => "INVALID_FINGERPRINT",
            Self::InvalidExtension(_) => "INVALID_EXTENSION",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::FragmentTooLarge { .. } => "FRAGMENT_TOO_LARGE",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::AssemblyInProgress(_) => "ASSEMBLY_IN_PROGRESS",
            Self::LayoutMismatch { .. } => "LAYOUT_MISMATCH",
            Self::AssemblyFailed { .. } => "ASSEMBLY_FAILED",
            Self::StorageWriteFailed { .. } => "STORAGE_WRITE_FAILED",
            Self::FingerprintMismatch { .. } => "FINGERPRINT_MISMATCH",
            Self::StorageError(_) => "STORAGE_ERROR",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
