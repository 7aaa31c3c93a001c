//! Upload Routes
//!
//! HTTP endpoints for resumable chunked uploads.
//!
//! Endpoints:
//! - POST /upload/check - Is the file complete, which fragments arrived
//! - POST /upload/upload - Upload one fragment (multipart)
//! - POST /upload/merge - Assemble the fragments into the final file

use axum::{
    extract::{Multipart, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::upload::{
    CheckUploadResponse, FileExtension, Fingerprint, MergeResponse, UploadError,
    UploadFragmentResponse,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    /// File fingerprint
    pub hash: String,
    pub ext: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub hash: String,
    pub ext: String,

    /// Total file size in bytes
    pub size: u64,

    /// Nominal fragment size; inferred from fragment 0 when omitted
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/check", post(check))
        .route("/upload", post(upload_fragment))
        .route("/merge", post(merge))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload/check
async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckUploadResponse>, UploadError> {
    let fingerprint = Fingerprint::parse(&request.hash)?;
    let extension = FileExtension::parse(&request.ext)?;

    let response = state.uploads().check_upload(&fingerprint, &extension).await?;
    Ok(Json(response))
}

/// POST /upload/upload
///
/// Multipart fields: `hash`, `ext`, `index` (or `chunkname` as
/// `<hash>-<index>`), and the fragment bytes in `chunk`.
async fn upload_fragment(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadFragmentResponse>, UploadError> {
    let mut hash = None;
    let mut ext = None;
    let mut index = None;
    let mut data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "hash" => hash = Some(read_text(field).await?),
            "ext" => ext = Some(read_text(field).await?),
            "index" => index = Some(parse_index(&read_text(field).await?)?),
            "chunkname" => {
                let chunk_name = read_text(field).await?;
                let (_, suffix) = chunk_name.rsplit_once('-').ok_or_else(|| {
                    UploadError::InvalidRequest(format!("chunkname {:?} has no index", chunk_name))
                })?;
                index = Some(parse_index(suffix)?);
            }
            "chunk" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
                data = Some(bytes);
            }
            _ => {}
        }
    }

    let fingerprint = Fingerprint::parse(&require(hash, "hash")?)?;
    let extension = FileExtension::parse(&require(ext, "ext")?)?;
    let index = require(index, "index")?;
    let data = require(data, "chunk")?;

    let response = state
        .uploads()
        .upload_fragment(&fingerprint, index, &extension, &data)
        .await?;
    Ok(Json(response))
}

/// POST /upload/merge
async fn merge(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<MergeResponse>, UploadError> {
    let fingerprint = Fingerprint::parse(&request.hash)?;
    let extension = FileExtension::parse(&request.ext)?;

    let response = state
        .uploads()
        .request_merge(&fingerprint, &extension, request.size, request.chunk_size)
        .await?;
    Ok(Json(response))
}

// ============================================================================
// Helpers
// ============================================================================

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, UploadError> {
    field
        .text()
        .await
        .map_err(|e| UploadError::InvalidRequest(e.to_string()))
}

fn parse_index(raw: &str) -> Result<usize, UploadError> {
    raw.trim()
        .parse()
        .map_err(|_| UploadError::InvalidRequest(format!("invalid fragment index {:?}", raw)))
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, UploadError> {
    value.ok_or_else(|| UploadError::InvalidRequest(format!("missing field `{}`", field)))
}

// ============================================================================
// Tests
// ============================================================================
