//! Storage bridge: file trees of storage-hosted applications, packed into and unpacked from
//! package archives. Backends are resolved per storage service record.

pub mod local;
pub mod s3;

use crate::bridge::{BridgeError, BridgeRequest, MetadataBridge, SYSTEM_SERVICE};
use crate::error::AppError;
use crate::package::archive::PackageArchive;
use crate::package::types::ServiceRecord;
use crate::settings::PackagerSettings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use local::LocalFileStorage;
pub use s3::S3Storage;

/// Service type of S3-backed storage services.
pub const S3_STORAGE_TYPE: &str = "aws_s3";

#[async_trait]
pub trait StorageBridge: Send + Sync {
    async fn container_exists(&self, container: &str) -> Result<bool, AppError>;

    async fn folder_exists(&self, container: &str, folder: &str) -> Result<bool, AppError>;

    /// Add every file under `container/folder` (the whole container when `folder` is empty)
    /// to `archive` as `<entry_root>/<relative path>`. Returns the number of files packed.
    async fn pack_folder(
        &self,
        container: &str,
        folder: &str,
        archive: &mut PackageArchive,
        entry_root: &str,
    ) -> Result<usize, AppError>;

    /// Write every remaining archive entry below `container/folder`, consuming the entries.
    /// Entries under `strip_prefix/` lose that prefix. Returns the number of files written.
    async fn unpack_archive(
        &self,
        container: &str,
        folder: &str,
        archive: &mut PackageArchive,
        strip_prefix: Option<&str>,
    ) -> Result<usize, AppError>;
}

/// Relative destination of an archive entry after prefix stripping. Entries outside the
/// prefix keep their full name; the prefix directory itself yields `None`.
pub(crate) fn unpacked_name<'a>(entry: &'a str, strip_prefix: Option<&str>) -> Option<&'a str> {
    let name = match strip_prefix.map(|p| p.trim_end_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => entry
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(entry),
        None => entry,
    };
    Some(name).filter(|n| !n.is_empty())
}

/// Join archive-style path segments, skipping empty ones.
pub(crate) fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Storage backends by storage service id. Backends registered up front win; otherwise the
/// service record is read through the metadata bridge and a backend is built for its type.
pub struct StorageRegistry {
    backends: RwLock<HashMap<i64, Arc<dyn StorageBridge>>>,
    settings: Arc<PackagerSettings>,
}

impl StorageRegistry {
    pub fn new(settings: Arc<PackagerSettings>) -> Self {
        StorageRegistry {
            backends: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub async fn register(&self, service_id: i64, backend: Arc<dyn StorageBridge>) {
        self.backends.write().await.insert(service_id, backend);
    }

    pub async fn len(&self) -> usize {
        self.backends.read().await.len()
    }

    /// Register a backend for every storage service known to `bridge`. Services that are not
    /// storage, or whose configuration is unusable, are skipped with a warning.
    pub async fn load<B>(&self, bridge: &B) -> Result<usize, AppError>
    where
        B: MetadataBridge + ?Sized,
    {
        let response = bridge
            .handle_request(BridgeRequest::get(SYSTEM_SERVICE, "service"))
            .await?;
        let rows = self.settings.envelope().unwrap(response);
        let mut loaded = 0;
        for row in rows {
            let record: ServiceRecord = match serde_json::from_value(row) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping service row: invalid record");
                    continue;
                }
            };
            if !is_storage_type(&record.definition.service_type, &self.settings) {
                continue;
            }
            match build_backend(&record, &self.settings).await {
                Ok(backend) => {
                    self.register(record.id, backend).await;
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(service = %record.definition.name, error = %e, "skipping storage service");
                }
            }
        }
        tracing::info!(count = loaded, "storage services loaded");
        Ok(loaded)
    }

    /// Backend for `service_id`, or `None` when no such storage service exists.
    pub async fn resolve<B>(&self, bridge: &B, service_id: i64) -> Result<Option<Arc<dyn StorageBridge>>, AppError>
    where
        B: MetadataBridge + ?Sized,
    {
        if let Some(backend) = self.backends.read().await.get(&service_id) {
            return Ok(Some(Arc::clone(backend)));
        }
        let row = match bridge
            .handle_request(BridgeRequest::get(SYSTEM_SERVICE, format!("service/{}", service_id)))
            .await
        {
            Ok(row) => row,
            Err(BridgeError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: ServiceRecord = serde_json::from_value(row)
            .map_err(|e| AppError::Internal(format!("invalid service record {}: {}", service_id, e)))?;
        if !is_storage_type(&record.definition.service_type, &self.settings) {
            return Ok(None);
        }
        build_backend(&record, &self.settings).await.map(Some)
    }
}

fn is_storage_type(service_type: &str, settings: &PackagerSettings) -> bool {
    service_type == settings.default_storage_type || service_type == local::LOCAL_STORAGE_TYPE || service_type == S3_STORAGE_TYPE
}

async fn build_backend(record: &ServiceRecord, settings: &PackagerSettings) -> Result<Arc<dyn StorageBridge>, AppError> {
    let def = &record.definition;
    let config = &def.config;
    if def.service_type == S3_STORAGE_TYPE {
        return Ok(Arc::new(S3Storage::from_config(config).await?));
    }
    let root = config
        .get("root")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| settings.storage_root.join(&def.name));
    Ok(Arc::new(LocalFileStorage::new(root)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MemoryMetadataStore;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn prefix_is_stripped_only_when_present() {
        assert_eq!(unpacked_name("todo/index.html", Some("todo/")), Some("index.html"));
        assert_eq!(unpacked_name("todo/css/a.css", Some("todo")), Some("css/a.css"));
        assert_eq!(unpacked_name("other/x", Some("todo")), Some("other/x"));
        assert_eq!(unpacked_name("todoish/x", Some("todo")), Some("todoish/x"));
        assert_eq!(unpacked_name("todo/x", None), Some("todo/x"));
    }

    #[test]
    fn keys_join_without_empty_segments() {
        assert_eq!(join_key(&["", "todo", "index.html"]), "todo/index.html");
        assert_eq!(join_key(&["/a/", "b"]), "a/b");
    }

    #[tokio::test]
    async fn load_registers_storage_services_only() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(PackagerSettings {
            storage_root: dir.path().to_path_buf(),
            ..PackagerSettings::default()
        });
        let store = MemoryMetadataStore::default();
        store.seed_service(json!({"name": "db1", "type": "sql_db"})).await.unwrap();
        let files = store.seed_service(json!({"name": "files", "type": "local_file"})).await.unwrap();
        store.seed_service(json!({"name": "broken", "deletable": "nope"})).await.ok();

        let registry = StorageRegistry::new(settings);
        assert_eq!(registry.load(&store).await.unwrap(), 1);
        assert!(registry.resolve(&store, files).await.unwrap().is_some());
        assert!(registry.resolve(&store, 1).await.unwrap().is_none());
        assert!(registry.resolve(&store, 999).await.unwrap().is_none());
    }
}
