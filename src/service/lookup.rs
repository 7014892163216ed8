//! Metadata lookups shared by export and import, generic over any bridge (store or transaction).

use crate::bridge::{BridgeError, BridgeRequest, MetadataBridge, ResourceEnvelope, SYSTEM_SERVICE};
use crate::error::AppError;
use crate::package::types::{AppRecord, ServiceRecord, ServiceRef};
use serde_json::Value;

fn decode<T: serde::de::DeserializeOwned>(what: &str, value: Value) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| AppError::Internal(format!("invalid {} record: {}", what, e)))
}

pub async fn fetch_app<B>(bridge: &B, app_id: i64) -> Result<AppRecord, AppError>
where
    B: MetadataBridge + ?Sized,
{
    match bridge
        .handle_request(BridgeRequest::get(SYSTEM_SERVICE, format!("app/{}", app_id)))
        .await
    {
        Ok(row) => decode("application", row),
        Err(BridgeError::NotFound(_)) => Err(AppError::NotFound(format!(
            "App not found in database with app id - {}",
            app_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Service by id or unique name; `None` when it does not exist.
pub async fn resolve_service<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    service: &ServiceRef,
) -> Result<Option<ServiceRecord>, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let row = match service {
        ServiceRef::Id(id) => {
            match bridge
                .handle_request(BridgeRequest::get(SYSTEM_SERVICE, format!("service/{}", id)))
                .await
            {
                Ok(row) => Some(row),
                Err(BridgeError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            }
        }
        ServiceRef::Name(name) => {
            let request = BridgeRequest::get(SYSTEM_SERVICE, "service")
                .with_query("name", name.as_str())
                .with_query("limit", "1");
            envelope
                .unwrap(bridge.handle_request(request).await?)
                .into_iter()
                .next()
        }
    };
    row.map(|r| decode("service", r)).transpose()
}

/// Id of the first service of the platform's default storage type.
pub async fn default_storage_service_id<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    storage_type: &str,
) -> Result<Option<i64>, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let request = BridgeRequest::get(SYSTEM_SERVICE, "service")
        .with_query("type", storage_type)
        .with_query("limit", "1");
    let rows = envelope.unwrap(bridge.handle_request(request).await?);
    Ok(rows.first().and_then(|r| r.get("id")).and_then(Value::as_i64))
}

/// Table definitions of exactly `tables` in `service`.
pub async fn fetch_schema<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    service: &str,
    tables: &[String],
) -> Result<Vec<Value>, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let request = BridgeRequest::get(service, "_schema").with_query("ids", tables.join(","));
    Ok(envelope.unwrap(bridge.handle_request(request).await?))
}

pub async fn fetch_records<B>(
    bridge: &B,
    envelope: &ResourceEnvelope,
    service: &str,
    table: &str,
) -> Result<Vec<Value>, AppError>
where
    B: MetadataBridge + ?Sized,
{
    let request = BridgeRequest::get(service, format!("_table/{}", table));
    Ok(envelope.unwrap(bridge.handle_request(request).await?))
}
