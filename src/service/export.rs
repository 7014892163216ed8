//! Export: application record, selected services, schema, data and files into one package.

use super::{lookup, PackageDownload, Packager};
use crate::bridge::{MetadataBridge, ResourceEnvelope};
use crate::error::{AppError, ExportPhase};
use crate::package::archive::{Backing, PackageArchive, PACKAGE_EXTENSION};
use crate::package::codec::{
    encode_data, encode_descriptor, encode_schema, encode_services, DATA_ENTRY, DESCRIPTION_ENTRY, SCHEMA_ENTRY,
    SERVICES_ENTRY,
};
use crate::package::types::{
    AppRecord, DataDocument, ExportOptions, ExportSelection, SchemaDocument, ServiceData, ServiceDefinition,
    ServiceSchema, TableData,
};
use crate::package::validator::{sanitize_file_stem, schema_selections, service_selections};
use uuid::Uuid;

/// A relational service and the tables selected from it.
struct SelectedTables {
    service: String,
    tables: Vec<String>,
}

impl Packager {
    /// Build a package for `app_id`. Nothing is persisted: on any failure the partial archive
    /// and its temp file are discarded.
    pub async fn export_application(&self, app_id: i64, options: &ExportOptions) -> Result<PackageDownload, AppError> {
        let bridge = self.store.as_ref();
        let envelope = self.settings.envelope();
        tracing::info!(app_id, "export started");

        let app = lookup::fetch_app(bridge, app_id)
            .await
            .map_err(|e| e.in_export(ExportPhase::Application))?;

        let path = self.settings.temp_dir.join(format!(
            "{}-{}.{}",
            sanitize_file_stem(&app.descriptor.name),
            Uuid::new_v4(),
            PACKAGE_EXTENSION
        ));
        let mut archive = PackageArchive::create(Backing::Owned(path))
            .map_err(|e| AppError::from(e).in_export(ExportPhase::Archive))?;

        encode_descriptor(&app.descriptor.portable())
            .and_then(|bytes| archive.write_entry(DESCRIPTION_ENTRY, bytes).map_err(AppError::from))
            .map_err(|e| e.in_export(ExportPhase::Description))?;

        let services = collect_services(bridge, &envelope, &options.selection)
            .await
            .map_err(|e| e.in_export(ExportPhase::Services))?;
        if !services.is_empty() {
            encode_services(&services)
                .and_then(|bytes| archive.write_entry(SERVICES_ENTRY, bytes).map_err(AppError::from))
                .map_err(|e| e.in_export(ExportPhase::Services))?;
        }

        let (schema, selected) = collect_schema(bridge, &envelope, &options.selection)
            .await
            .map_err(|e| e.in_export(ExportPhase::Schema))?;
        if !schema.service.is_empty() {
            encode_schema(&schema)
                .and_then(|bytes| archive.write_entry(SCHEMA_ENTRY, bytes).map_err(AppError::from))
                .map_err(|e| e.in_export(ExportPhase::Schema))?;
        }

        if options.include_data {
            let data = collect_data(bridge, &envelope, &selected)
                .await
                .map_err(|e| e.in_export(ExportPhase::Data))?;
            if !data.service.is_empty() {
                encode_data(&data)
                    .and_then(|bytes| archive.write_entry(DATA_ENTRY, bytes).map_err(AppError::from))
                    .map_err(|e| e.in_export(ExportPhase::Data))?;
            }
        }

        if options.include_files && app.descriptor.is_storage_hosted() {
            let packed = self
                .pack_files(&app, &envelope, &mut archive)
                .await
                .map_err(|e| e.in_export(ExportPhase::Files))?;
            tracing::info!(app_id, files = packed, "packed application files");
        }

        archive
            .finish()
            .map_err(|e| AppError::from(e).in_export(ExportPhase::Delivery))?;
        let bytes = tokio::fs::read(archive.path())
            .await
            .map_err(|e| AppError::Internal(format!("cannot read package file: {}", e)).in_export(ExportPhase::Delivery))?;
        let entries = archive.len();
        archive.close();

        tracing::info!(app_id, app = %app.descriptor.name, entries, bytes = bytes.len(), "export finished");
        Ok(PackageDownload {
            file_name: format!("{}.{}", app.descriptor.name, PACKAGE_EXTENSION),
            bytes,
        })
    }

    async fn pack_files(
        &self,
        app: &AppRecord,
        envelope: &ResourceEnvelope,
        archive: &mut PackageArchive,
    ) -> Result<usize, AppError> {
        let bridge = self.store.as_ref();
        let storage_id = match app.descriptor.storage_service_id {
            Some(id) => Some(id),
            None => lookup::default_storage_service_id(bridge, envelope, &self.settings.default_storage_type).await?,
        };
        let storage_id =
            storage_id.ok_or_else(|| AppError::Internal("Can not find storage service identifier.".into()))?;
        let backend = self.storage.resolve(bridge, storage_id).await?.ok_or_else(|| {
            AppError::Internal(format!("Can not find storage service by identifier '{}'.", storage_id))
        })?;

        let name = app.descriptor.name.as_str();
        match app.descriptor.storage_container.as_deref().filter(|c| !c.is_empty()) {
            None => {
                if backend.container_exists(name).await? {
                    backend.pack_folder(name, "", archive, name).await
                } else {
                    Ok(0)
                }
            }
            Some(container) => {
                if backend.folder_exists(container, name).await? {
                    backend.pack_folder(container, name, archive, name).await
                } else {
                    Ok(0)
                }
            }
        }
    }
}

/// Snapshots of the selected services. Missing and non-deletable services are skipped.
async fn collect_services<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    selection: &ExportSelection,
) -> Result<Vec<ServiceDefinition>, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let mut services = Vec::new();
    for reference in service_selections(selection) {
        match lookup::resolve_service(bridge, envelope, &reference).await? {
            Some(record) if record.definition.deletable => services.push(record.definition),
            Some(_) => tracing::warn!(service = %reference, "skipping non-deletable service"),
            None => tracing::warn!(service = %reference, "skipping unknown service"),
        }
    }
    Ok(services)
}

/// Schema of the selected tables of relational services. An unresolvable service aborts.
async fn collect_schema<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    selection: &ExportSelection,
) -> Result<(SchemaDocument, Vec<SelectedTables>), AppError>
where
    B: MetadataBridge + ?Sized,
{
    let mut schema = SchemaDocument::default();
    let mut selected = Vec::new();
    for item in schema_selections(selection) {
        let record = lookup::resolve_service(bridge, envelope, &item.service)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("service '{}' selected for schema export", item.service)))?;
        let def = record.definition;
        if !def.deletable {
            tracing::warn!(service = %def.name, "skipping schema of non-deletable service");
            continue;
        }
        if !def.is_relational_db() {
            tracing::warn!(service = %def.name, service_type = %def.service_type, "skipping schema of non-database service");
            continue;
        }
        let tables = lookup::fetch_schema(bridge, envelope, &def.name, &item.tables).await?;
        schema.service.push(ServiceSchema {
            name: def.name.clone(),
            table: tables,
        });
        selected.push(SelectedTables {
            service: def.name,
            tables: item.tables,
        });
    }
    Ok((schema, selected))
}

async fn collect_data<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    selected: &[SelectedTables],
) -> Result<DataDocument, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let mut data = DataDocument::default();
    for item in selected {
        let mut tables = Vec::with_capacity(item.tables.len());
        for table in &item.tables {
            let record = lookup::fetch_records(bridge, envelope, &item.service, table).await?;
            tables.push(TableData {
                name: table.clone(),
                record,
            });
        }
        data.service.push(ServiceData {
            name: item.service.clone(),
            table: tables,
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MemoryMetadataStore;
    use crate::package::types::{Components, ServiceRef};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn schema_selection_of_unknown_service_aborts() {
        let store = MemoryMetadataStore::default();
        let mut schemas = BTreeMap::new();
        schemas.insert("ghost".to_string(), Components::Csv("orders".into()));
        let selection = ExportSelection {
            services: vec![],
            schemas,
        };
        let err = collect_schema(&store, &ResourceEnvelope::default(), &selection)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_database_services_contribute_no_schema() {
        let store = MemoryMetadataStore::default();
        store
            .seed_service(json!({"name": "email_service", "type": "smtp_email"}))
            .await
            .unwrap();
        let mut schemas = BTreeMap::new();
        schemas.insert("email_service".to_string(), Components::List(vec!["x".into()]));
        let selection = ExportSelection {
            services: vec![ServiceRef::Name("email_service".into())],
            schemas,
        };
        let (schema, selected) = collect_schema(&store, &ResourceEnvelope::default(), &selection)
            .await
            .unwrap();
        assert!(schema.service.is_empty());
        assert!(selected.is_empty());
    }
}
