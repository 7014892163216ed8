//! Import: recreate an application from a package inside one metadata transaction.
//!
//! Phases run in order: application, services, schema, data, files. Any failure rolls the
//! transaction back. Files are written last and are not undone by the rollback.

use super::{lookup, ImportedApp, Packager};
use crate::bridge::{BridgeError, BridgeRequest, MetadataBridge, MetadataTransaction, ResourceEnvelope, SYSTEM_SERVICE};
use crate::error::{AppError, ImportPhase};
use crate::package::archive::PackageArchive;
use crate::package::codec::{merge_overrides, take_data, take_descriptor, take_schema, take_services};
use crate::package::types::{AppDescriptor, AppRecord};
use serde_json::{Map, Value};

impl Packager {
    /// Import an opened package. `overrides` win over the archived description. The archive is
    /// consumed and released on every exit path.
    pub async fn import_application(
        &self,
        mut archive: PackageArchive,
        overrides: &Map<String, Value>,
    ) -> Result<ImportedApp, AppError> {
        let descriptor = take_descriptor(&mut archive)
            .and_then(|d| merge_overrides(d, overrides))
            .map_err(|e| e.in_import(ImportPhase::Description))?;
        tracing::info!(app = %descriptor.name, "import started");

        let tx = self
            .store
            .begin()
            .await
            .map_err(|e| AppError::from(e).in_import(ImportPhase::Application))?;

        let outcome = self.replay(tx.as_ref(), &descriptor, &mut archive).await;
        match outcome {
            Ok((app, applied)) => {
                tx.commit()
                    .await
                    .map_err(|e| AppError::from(e).in_import(ImportPhase::Commit))?;
                tracing::info!(app_id = app.id, app = %app.descriptor.name, ?applied, "import committed");
                Ok(ImportedApp { app, applied })
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "import rollback failed");
                }
                tracing::warn!(app = %descriptor.name, error = %e, "import rolled back");
                Err(e)
            }
        }
    }

    async fn replay(
        &self,
        tx: &dyn MetadataTransaction,
        descriptor: &AppDescriptor,
        archive: &mut PackageArchive,
    ) -> Result<(AppRecord, Vec<ImportPhase>), AppError> {
        let envelope = self.settings.envelope();
        let mut applied = Vec::with_capacity(5);

        let app = create_app(tx, &envelope, descriptor)
            .await
            .map_err(|e| e.in_import(ImportPhase::Application))?;
        applied.push(ImportPhase::Application);
        tracing::info!(app_id = app.id, app = %app.descriptor.name, "application record created");

        if insert_services(tx, &envelope, archive)
            .await
            .map_err(|e| e.in_import(ImportPhase::Services))?
        {
            applied.push(ImportPhase::Services);
        }
        if insert_schema(tx, &envelope, archive)
            .await
            .map_err(|e| e.in_import(ImportPhase::Schema))?
        {
            applied.push(ImportPhase::Schema);
        }
        if insert_data(tx, &envelope, archive)
            .await
            .map_err(|e| e.in_import(ImportPhase::Data))?
        {
            applied.push(ImportPhase::Data);
        }

        if !archive.is_empty() {
            let written = self
                .store_files(tx, &envelope, descriptor, archive)
                .await
                .map_err(|e| e.in_import(ImportPhase::Files))?;
            applied.push(ImportPhase::Files);
            tracing::info!(app_id = app.id, files = written, "application files stored");
        }
        Ok((app, applied))
    }

    async fn store_files(
        &self,
        tx: &dyn MetadataTransaction,
        envelope: &ResourceEnvelope,
        descriptor: &AppDescriptor,
        archive: &mut PackageArchive,
    ) -> Result<usize, AppError> {
        let storage_id = match descriptor.storage_service_id {
            Some(id) => Some(id),
            None => lookup::default_storage_service_id(tx, envelope, &self.settings.default_storage_type).await?,
        };
        let storage_id =
            storage_id.ok_or_else(|| AppError::Internal("Can not find storage service identifier.".into()))?;
        let backend = self.storage.resolve(tx, storage_id).await?.ok_or_else(|| {
            AppError::Internal(format!(
                "App record created, but failed to import files due to unknown storage service with id '{}'.",
                storage_id
            ))
        })?;

        let name = descriptor.name.as_str();
        match descriptor.storage_container.as_deref() {
            None => {
                backend
                    .unpack_archive(&self.settings.default_storage_folder, "", archive, None)
                    .await
            }
            Some("") => {
                let prefix = format!("{}/", name);
                backend.unpack_archive(name, "", archive, Some(&prefix)).await
            }
            Some(container) => backend.unpack_archive(container, "", archive, None).await,
        }
    }
}

async fn create_app<B>(bridge: &B, envelope: &ResourceEnvelope, descriptor: &AppDescriptor) -> Result<AppRecord, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let record = serde_json::to_value(descriptor)
        .map_err(|e| AppError::Internal(format!("cannot encode application: {}", e)))?;
    let request = BridgeRequest::post(SYSTEM_SERVICE, "app", envelope.wrap_payload(vec![record]))
        .with_query("fields", "*");
    let response = bridge
        .handle_request(request)
        .await
        .map_err(|e| AppError::Internal(format!("Could not create the application.\n{}", e)))?;
    let created = envelope
        .unwrap(response)
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Internal("Could not create the application.\nempty response".into()))?;
    serde_json::from_value(created)
        .map_err(|e| AppError::Internal(format!("Could not create the application.\n{}", e)))
}

/// Returns whether a services entry was present.
async fn insert_services<B>(bridge: &B, envelope: &ResourceEnvelope, archive: &mut PackageArchive) -> Result<bool, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let services = match take_services(archive)? {
        Some(services) => services,
        None => return Ok(false),
    };
    if services.is_empty() {
        return Ok(true);
    }
    let records = services
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Internal(format!("cannot encode services: {}", e)))?;
    let count = records.len();
    bridge
        .handle_request(BridgeRequest::post(SYSTEM_SERVICE, "service", envelope.wrap_payload(records)))
        .await
        .map_err(|e| AppError::Internal(format!("Could not create the services.\n{}", e)))?;
    tracing::info!(count, "services created");
    Ok(true)
}

/// Schema and data replay share one policy: `NotFound` and `Internal` abort the import, every
/// other bridge error is logged and the step skipped.
fn tolerate(result: Result<Value, BridgeError>, resource: &str) -> Result<(), AppError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_fatal_for_replay() => Err(e.into()),
        Err(e) => {
            tracing::warn!(resource = %resource, status = e.status(), error = %e, "tolerated bridge error during replay");
            Ok(())
        }
    }
}

async fn insert_schema<B>(bridge: &B, envelope: &ResourceEnvelope, archive: &mut PackageArchive) -> Result<bool, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let schema = match take_schema(archive)? {
        Some(schema) => schema,
        None => return Ok(false),
    };
    if schema.service.is_empty() {
        return Err(AppError::BadRequest(
            "Could not create the database tables for this application.\nDatabase service or schema not found in schema.json."
                .into(),
        ));
    }
    for group in schema.service {
        if group.table.is_empty() {
            continue;
        }
        let count = group.table.len();
        let request = BridgeRequest::post(&group.name, "_schema", envelope.wrap_payload(group.table));
        tolerate(bridge.handle_request(request).await, &group.name)?;
        tracing::debug!(service = %group.name, tables = count, "schema replayed");
    }
    Ok(true)
}

async fn insert_data<B>(bridge: &B, envelope: &ResourceEnvelope, archive: &mut PackageArchive) -> Result<bool, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let data = match take_data(archive)? {
        Some(data) => data,
        None => return Ok(false),
    };
    if data.service.is_empty() {
        return Err(AppError::BadRequest(
            "Could not create the database tables for this application.\nDatabase service or data not found.".into(),
        ));
    }
    for group in data.service {
        for table in group.table {
            if table.record.is_empty() {
                continue;
            }
            let resource = format!("{}/{}", group.name, table.name);
            let count = table.record.len();
            let request = BridgeRequest::post(
                &group.name,
                format!("_table/{}", table.name),
                envelope.wrap_payload(table.record),
            );
            tolerate(bridge.handle_request(request).await, &resource)?;
            tracing::debug!(table = %resource, records = count, "data replayed");
        }
    }
    Ok(true)
}
