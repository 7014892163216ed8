//! Descriptor codec: the fixed set of JSON documents inside a package archive.
//!
//! `take_*` helpers consume their entry and return `None` when it is absent, which callers treat
//! as "skip this phase". A present entry that decodes to an empty document is returned as such:
//! the phase runs and has nothing to do.

use crate::error::AppError;
use crate::package::archive::PackageArchive;
use crate::package::types::{AppDescriptor, DataDocument, SchemaDocument, ServiceDefinition};
use serde_json::{Map, Value};

pub const DESCRIPTION_ENTRY: &str = "description.json";
/// Deprecated name of the description document, still accepted on import.
pub const LEGACY_DESCRIPTION_ENTRY: &str = "app.json";
pub const SERVICES_ENTRY: &str = "services.json";
pub const SCHEMA_ENTRY: &str = "schema.json";
pub const DATA_ENTRY: &str = "data.json";

/// Entry names that are package documents rather than application files.
pub const DOCUMENT_ENTRIES: &[&str] = &[
    DESCRIPTION_ENTRY,
    LEGACY_DESCRIPTION_ENTRY,
    SERVICES_ENTRY,
    SCHEMA_ENTRY,
    DATA_ENTRY,
];

fn parse_json(entry: &str, bytes: &[u8]) -> Result<Value, AppError> {
    serde_json::from_slice(bytes).map_err(|e| AppError::BadRequest(format!("invalid {}: {}", entry, e)))
}

fn to_json_bytes<T: serde::Serialize>(entry: &str, value: &T) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec(value).map_err(|e| AppError::Internal(format!("cannot encode {}: {}", entry, e)))
}

/// Prefer `api_name` over `name` and drop `api_name` so only the normalized key remains.
fn normalize_name(obj: &mut Map<String, Value>) {
    if let Some(api_name) = obj.remove("api_name") {
        if api_name.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false) {
            obj.insert("name".into(), api_name);
        }
    }
}

pub fn decode_descriptor(bytes: &[u8]) -> Result<AppDescriptor, AppError> {
    let mut value = parse_json(DESCRIPTION_ENTRY, bytes)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| AppError::BadRequest("application description must be a JSON object".into()))?;
    normalize_name(obj);
    let has_name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if !has_name {
        return Err(AppError::BadRequest("application description must have 'name' (string)".into()));
    }
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("invalid {}: {}", DESCRIPTION_ENTRY, e)))
}

pub fn encode_descriptor(descriptor: &AppDescriptor) -> Result<Vec<u8>, AppError> {
    to_json_bytes(DESCRIPTION_ENTRY, descriptor)
}

/// Consume the description document. Both the current and the deprecated entry are removed;
/// the current one wins when both are present.
pub fn take_descriptor(archive: &mut PackageArchive) -> Result<AppDescriptor, AppError> {
    let current = archive.take_entry(DESCRIPTION_ENTRY);
    let legacy = archive.take_entry(LEGACY_DESCRIPTION_ENTRY);
    let bytes = current
        .or(legacy)
        .ok_or_else(|| AppError::BadRequest("No application description file in this package file.".into()))?;
    decode_descriptor(&bytes)
}

/// Apply caller-supplied fields over the archived descriptor. Caller fields win; `null` values
/// are ignored so an override can never erase a field.
pub fn merge_overrides(descriptor: AppDescriptor, overrides: &Map<String, Value>) -> Result<AppDescriptor, AppError> {
    if overrides.is_empty() {
        return Ok(descriptor);
    }
    let mut value = serde_json::to_value(&descriptor)
        .map_err(|e| AppError::Internal(format!("cannot encode application description: {}", e)))?;
    let mut patch: Map<String, Value> = overrides
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    normalize_name(&mut patch);
    if let Some(obj) = value.as_object_mut() {
        obj.extend(patch);
    }
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("invalid application fields: {}", e)))
}

pub fn decode_services(bytes: &[u8]) -> Result<Vec<ServiceDefinition>, AppError> {
    let value = parse_json(SERVICES_ENTRY, bytes)?;
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("invalid {}: {}", SERVICES_ENTRY, e)))
}

pub fn encode_services(services: &[ServiceDefinition]) -> Result<Vec<u8>, AppError> {
    to_json_bytes(SERVICES_ENTRY, &services)
}

pub fn take_services(archive: &mut PackageArchive) -> Result<Option<Vec<ServiceDefinition>>, AppError> {
    archive.take_entry(SERVICES_ENTRY).map(|b| decode_services(&b)).transpose()
}

pub fn decode_schema(bytes: &[u8]) -> Result<SchemaDocument, AppError> {
    let value = parse_json(SCHEMA_ENTRY, bytes)?;
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("invalid {}: {}", SCHEMA_ENTRY, e)))
}

pub fn encode_schema(schema: &SchemaDocument) -> Result<Vec<u8>, AppError> {
    to_json_bytes(SCHEMA_ENTRY, schema)
}

pub fn take_schema(archive: &mut PackageArchive) -> Result<Option<SchemaDocument>, AppError> {
    archive.take_entry(SCHEMA_ENTRY).map(|b| decode_schema(&b)).transpose()
}

pub fn decode_data(bytes: &[u8]) -> Result<DataDocument, AppError> {
    let value = parse_json(DATA_ENTRY, bytes)?;
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("invalid {}: {}", DATA_ENTRY, e)))
}

pub fn encode_data(data: &DataDocument) -> Result<Vec<u8>, AppError> {
    to_json_bytes(DATA_ENTRY, data)
}

pub fn take_data(archive: &mut PackageArchive) -> Result<Option<DataDocument>, AppError> {
    archive.take_entry(DATA_ENTRY).map(|b| decode_data(&b)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::archive::Backing;
    use crate::package::types::AppType;
    use serde_json::json;
    use tempfile::TempDir;

    fn archive_with(dir: &TempDir, entries: &[(&str, Value)]) -> PackageArchive {
        let mut archive = PackageArchive::create(Backing::Borrowed(dir.path().join("t.dfpkg"))).unwrap();
        for (name, value) in entries {
            archive.write_entry(name, serde_json::to_vec(value).unwrap()).unwrap();
        }
        archive
    }

    #[test]
    fn api_name_wins_over_name() {
        let d = decode_descriptor(br#"{"name":"Display Name","api_name":"todo","type":0}"#).unwrap();
        assert_eq!(d.name, "todo");
        assert!(!d.extra.contains_key("api_name"));
    }

    #[test]
    fn descriptor_without_name_is_rejected() {
        let err = decode_descriptor(br#"{"description":"x"}"#).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        let err = decode_descriptor(b"[1,2]").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn legacy_description_is_accepted_and_both_are_consumed() {
        let dir = TempDir::new().unwrap();
        let mut archive = archive_with(
            &dir,
            &[
                (LEGACY_DESCRIPTION_ENTRY, json!({"name": "old"})),
                (DESCRIPTION_ENTRY, json!({"name": "new"})),
            ],
        );
        assert_eq!(take_descriptor(&mut archive).unwrap().name, "new");
        assert!(archive.is_empty());

        let mut archive = archive_with(&dir, &[(LEGACY_DESCRIPTION_ENTRY, json!({"name": "old"}))]);
        assert_eq!(take_descriptor(&mut archive).unwrap().name, "old");
    }

    #[test]
    fn missing_description_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let mut archive = archive_with(&dir, &[(SERVICES_ENTRY, json!([]))]);
        assert!(matches!(take_descriptor(&mut archive), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn absent_and_empty_are_distinct() {
        let dir = TempDir::new().unwrap();
        let mut archive = archive_with(&dir, &[(SERVICES_ENTRY, json!([]))]);
        assert_eq!(take_services(&mut archive).unwrap(), Some(vec![]));
        assert_eq!(take_services(&mut archive).unwrap(), None);
        assert_eq!(take_schema(&mut archive).unwrap(), None);
        assert_eq!(take_data(&mut archive).unwrap(), None);
    }

    #[test]
    fn overrides_win_and_nulls_are_ignored() {
        let d = decode_descriptor(br#"{"name":"todo","description":"from archive","type":1}"#).unwrap();
        let overrides = json!({"api_name": "todo2", "description": null, "is_active": false, "storage_container": ""});
        let merged = merge_overrides(d, overrides.as_object().unwrap()).unwrap();
        assert_eq!(merged.name, "todo2");
        assert_eq!(merged.description.as_deref(), Some("from archive"));
        assert!(!merged.is_active);
        assert_eq!(merged.app_type, AppType::StorageService);
        assert_eq!(merged.storage_container.as_deref(), Some(""));
    }

    #[test]
    fn schema_and_data_shapes() {
        let schema = decode_schema(br#"{"service":[{"name":"db1","table":[{"name":"orders"}]}]}"#).unwrap();
        assert_eq!(schema.service[0].name, "db1");
        assert_eq!(schema.service[0].table.len(), 1);
        let data = decode_data(br#"{"service":[{"name":"db1","table":[{"name":"orders","record":[{"id":1}]}]}]}"#).unwrap();
        assert_eq!(data.service[0].table[0].record, vec![json!({"id": 1})]);
        assert!(matches!(decode_schema(b"{not json"), Err(AppError::BadRequest(_))));
    }
}
