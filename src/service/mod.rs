//! Packager: application export and import over the metadata and storage bridges.

mod export;
mod import;
pub mod lookup;

use crate::bridge::MetadataStore;
use crate::error::{AppError, ImportPhase};
use crate::package::types::AppRecord;
use crate::settings::PackagerSettings;
use crate::source::{open_source, PackageSource};
use crate::storage::StorageRegistry;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Finished export archive, ready for delivery.
#[derive(Clone, Debug)]
pub struct PackageDownload {
    /// `<app name>.dfpkg`
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportedApp {
    pub app: AppRecord,
    /// Phases that ran, in order. Skipped phases are absent.
    pub applied: Vec<ImportPhase>,
}

#[derive(Clone)]
pub struct Packager {
    store: Arc<dyn MetadataStore>,
    storage: Arc<StorageRegistry>,
    settings: Arc<PackagerSettings>,
}

impl Packager {
    pub fn new(store: Arc<dyn MetadataStore>, storage: Arc<StorageRegistry>, settings: Arc<PackagerSettings>) -> Self {
        Packager {
            store,
            storage,
            settings,
        }
    }

    pub fn settings(&self) -> &PackagerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<StorageRegistry> {
        &self.storage
    }

    /// Validate and open `source`, then import it. The archive (and any temp file behind it)
    /// is released when the import returns.
    pub async fn import_from_source(
        &self,
        source: PackageSource,
        overrides: &Map<String, Value>,
        http: &reqwest::Client,
    ) -> Result<ImportedApp, AppError> {
        let archive = open_source(source, &self.settings, http).await?;
        self.import_application(archive, overrides).await
    }
}
