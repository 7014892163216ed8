//! Resource paths understood by the metadata bridge implementations.

use super::{BridgeError, QueryOptions};
use serde_json::Value;

/// Service holding application and service records.
pub const SYSTEM_SERVICE: &str = "system";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    /// `system/app`
    Apps,
    /// `system/app/{id}`
    App(i64),
    /// `system/service`
    Services,
    /// `system/service/{id}`
    Service(i64),
    /// `{service}/_schema`
    Schema,
    /// `{service}/_schema/{table}`
    SchemaTable(String),
    /// `{service}/_table/{table}`
    Table(String),
}

impl Resource {
    pub fn parse(service: &str, path: &str) -> Result<Resource, BridgeError> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|p| !p.is_empty()).collect();
        let unknown = || BridgeError::NotFound(format!("unknown resource '{}/{}'", service, path));
        let id = |s: &str| {
            s.parse::<i64>()
                .map_err(|_| BridgeError::BadRequest(format!("invalid id '{}'", s)))
        };

        if service == SYSTEM_SERVICE {
            return match parts.as_slice() {
                ["app"] => Ok(Resource::Apps),
                ["app", raw] => Ok(Resource::App(id(raw)?)),
                ["service"] => Ok(Resource::Services),
                ["service", raw] => Ok(Resource::Service(id(raw)?)),
                _ => Err(unknown()),
            };
        }
        match parts.as_slice() {
            ["_schema"] => Ok(Resource::Schema),
            ["_schema", table] => Ok(Resource::SchemaTable(table.to_string())),
            ["_table", table] => Ok(Resource::Table(table.to_string())),
            _ => Err(unknown()),
        }
    }
}

/// Whether a record passes every equality filter in `query`. Numbers and booleans compare by
/// their JSON text, so `type=1` matches `"type": 1`.
pub fn matches_filters(record: &Value, query: &QueryOptions) -> bool {
    query.filters().all(|(key, expected)| match record.get(key) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Null) | None => expected.is_empty() || expected == "null",
        Some(other) => other.to_string() == expected,
    })
}
