//! App packager: export an application (record, services, schema, data, files) as a `.dfpkg`
//! archive and recreate it from one, over a PostgreSQL metadata store and pluggable file storage.

pub mod bridge;
pub mod error;
pub mod handlers;
pub mod package;
pub mod response;
pub mod routes;
pub mod service;
pub mod settings;
pub mod source;
pub mod state;
pub mod storage;
pub mod store;

pub use bridge::{MemoryMetadataStore, MetadataBridge, MetadataStore, MetadataTransaction};
pub use error::{AppError, ConfigError, ExportPhase, ImportPhase};
pub use package::types::{AppDescriptor, AppRecord, ExportOptions, ExportSelection};
pub use response::{success_one, success_one_ok};
pub use routes::{common_routes, package_routes, router};
pub use service::{ImportedApp, PackageDownload, Packager};
pub use settings::PackagerSettings;
pub use source::PackageSource;
pub use state::AppState;
pub use storage::{LocalFileStorage, StorageBridge, StorageRegistry};
pub use store::{ensure_database_exists, ensure_sys_tables, PgMetadataStore};
