//! Metadata bridge: the verb + service + resource + payload contract through which the packager
//! creates and reads application, service, schema and record metadata. Implementations live in
//! [`memory`] (in-process) and [`crate::store`] (PostgreSQL).

pub mod memory;
pub mod resource;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use memory::MemoryMetadataStore;
pub use resource::{Resource, SYSTEM_SERVICE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Query options. Reserved keys are `ids`, `fields` and `limit`; every other key is an
/// equality filter on the listed records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    params: BTreeMap<String, String>,
}

pub const RESERVED_QUERY_KEYS: &[&str] = &["ids", "fields", "limit"];

impl QueryOptions {
    pub fn new() -> Self {
        QueryOptions::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Comma-separated `ids`, trimmed, empty parts dropped.
    pub fn ids(&self) -> Option<Vec<String>> {
        self.get("ids").map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        })
    }

    pub fn limit(&self) -> Option<usize> {
        self.get("limit").and_then(|s| s.parse().ok())
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter(|(k, _)| !RESERVED_QUERY_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BridgeRequest {
    pub verb: Verb,
    pub service: String,
    pub resource: String,
    pub query: QueryOptions,
    pub payload: Option<Value>,
}

impl BridgeRequest {
    pub fn get(service: &str, resource: impl Into<String>) -> Self {
        BridgeRequest {
            verb: Verb::Get,
            service: service.to_string(),
            resource: resource.into(),
            query: QueryOptions::new(),
            payload: None,
        }
    }

    pub fn post(service: &str, resource: impl Into<String>, payload: Value) -> Self {
        BridgeRequest {
            verb: Verb::Post,
            service: service.to_string(),
            resource: resource.into(),
            query: QueryOptions::new(),
            payload: Some(payload),
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query = self.query.with(key, value);
        self
    }
}

impl fmt::Display for BridgeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.verb, self.service, self.resource)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl BridgeError {
    pub fn status(&self) -> u16 {
        match self {
            BridgeError::NotFound(_) => 404,
            BridgeError::Internal(_) => 500,
            BridgeError::BadRequest(_) => 400,
            BridgeError::Forbidden(_) => 403,
            BridgeError::Conflict(_) => 409,
            BridgeError::Rejected { status, .. } => *status,
        }
    }

    /// Whether schema/data replay must abort on this error. Only missing services/tables and
    /// internal failures abort; every other class is logged and skipped.
    pub fn is_fatal_for_replay(&self) -> bool {
        matches!(self, BridgeError::NotFound(_) | BridgeError::Internal(_))
    }
}

/// How record arrays travel in payloads and responses: wrapped as `{<wrapper>: [...]}` or bare.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceEnvelope {
    pub wrapper: String,
    pub always_wrap: bool,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        ResourceEnvelope::new(crate::settings::DEFAULT_RESOURCE_WRAPPER, true)
    }
}

impl ResourceEnvelope {
    pub fn new(wrapper: &str, always_wrap: bool) -> Self {
        ResourceEnvelope {
            wrapper: wrapper.to_string(),
            always_wrap,
        }
    }

    /// Request payload for bulk records. Payloads are always wrapped.
    pub fn wrap_payload(&self, records: Vec<Value>) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(self.wrapper.clone(), Value::Array(records));
        Value::Object(obj)
    }

    /// Response body for a list of records, wrapped only when configured.
    pub fn wrap_response(&self, records: Vec<Value>) -> Value {
        if self.always_wrap {
            self.wrap_payload(records)
        } else {
            Value::Array(records)
        }
    }

    /// Records from a payload or response: `{<wrapper>: [...]}`, a bare array, or a single object.
    pub fn unwrap(&self, value: Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove(&self.wrapper) {
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
                None => vec![Value::Object(obj)],
            },
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

#[async_trait]
pub trait MetadataBridge: Send + Sync {
    async fn handle_request(&self, request: BridgeRequest) -> Result<Value, BridgeError>;
}

/// A unit of work whose effects become visible to other readers only on commit.
#[async_trait]
pub trait MetadataTransaction: MetadataBridge {
    async fn commit(self: Box<Self>) -> Result<(), BridgeError>;
    async fn rollback(self: Box<Self>) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait MetadataStore: MetadataBridge {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, BridgeError>;
}
