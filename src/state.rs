//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::{FragmentStore, UploadError, UploadService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
}

impl AppState {
    /// Create the storage namespaces and warm the dedup cache
    pub async fn new(config: Config) -> Result<Self, UploadError> {
        let store = FragmentStore::with_max_fragment_size(
            config.upload.upload_dir.clone(),
            config.upload.max_fragment_size,
        );
        store.init().await?;

        let uploads = UploadService::new(store, config.upload.assembly());
        uploads.dedup().preload().await?;

        Ok(Self {
            inner: Arc::new(AppStateInner { config, uploads }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload intake service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }
}
