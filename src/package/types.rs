//! Package document types matching the JSON stored in a package archive, plus the export selection.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Service type of relational database services; only these carry schema and data.
pub const SQL_DB_TYPE: &str = "sql_db";

/// How an application is hosted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum AppType {
    #[default]
    None,
    /// Files live in a storage service and travel with the package.
    StorageService,
    Url,
    Path,
}

impl TryFrom<i64> for AppType {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AppType::None),
            1 => Ok(AppType::StorageService),
            2 => Ok(AppType::Url),
            3 => Ok(AppType::Path),
            other => Err(format!("unknown app type {} (expected 0..=3)", other)),
        }
    }
}

impl From<AppType> for i64 {
    fn from(t: AppType) -> i64 {
        match t {
            AppType::None => 0,
            AppType::StorageService => 1,
            AppType::Url => 2,
            AppType::Path => 3,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Application description (`description.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, rename = "type")]
    pub app_type: AppType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub requires_fullscreen: bool,
    #[serde(default = "default_true")]
    pub allow_fullscreen_toggle: bool,
    #[serde(default)]
    pub toggle_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_service_id: Option<i64>,
    /// `None` means "use the default folder"; `Some("")` means "a container named after the app".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_container: Option<String>,
    /// Fields this crate does not interpret; passed through to the metadata bridge.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppDescriptor {
    pub fn is_storage_hosted(&self) -> bool {
        self.app_type == AppType::StorageService
    }

    /// Portable subset written on export: system-local ids and unknown fields are dropped.
    pub fn portable(&self) -> AppDescriptor {
        AppDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            is_active: self.is_active,
            app_type: self.app_type,
            path: self.path.clone(),
            url: self.url.clone(),
            requires_fullscreen: self.requires_fullscreen,
            allow_fullscreen_toggle: self.allow_fullscreen_toggle,
            toggle_location: self.toggle_location.clone(),
            storage_service_id: None,
            storage_container: self.storage_container.clone(),
            extra: Map::new(),
        }
    }
}

/// Application record as held by the metadata store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: i64,
    #[serde(flatten)]
    pub descriptor: AppDescriptor,
}

/// One entry of `services.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub mutable: bool,
    #[serde(default = "default_true")]
    pub deletable: bool,
    #[serde(default)]
    pub config: Value,
}

impl ServiceDefinition {
    pub fn is_relational_db(&self) -> bool {
        self.service_type == SQL_DB_TYPE
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: i64,
    #[serde(flatten)]
    pub definition: ServiceDefinition,
}

/// `schema.json`: table definitions grouped by service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub service: Vec<ServiceSchema>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSchema {
    pub name: String,
    /// Table definitions as the data service describes them; opaque to the packager.
    #[serde(default)]
    pub table: Vec<Value>,
}

/// `data.json`: records grouped by service and table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataDocument {
    #[serde(default)]
    pub service: Vec<ServiceData>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceData {
    pub name: String,
    #[serde(default)]
    pub table: Vec<TableData>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub name: String,
    #[serde(default)]
    pub record: Vec<Value>,
}

/// Reference to a service by numeric id or unique name. Numeric strings are ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServiceRef {
    Id(i64),
    Name(String),
}

impl FromStr for ServiceRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<i64>() {
            Ok(id) => ServiceRef::Id(id),
            Err(_) => ServiceRef::Name(s.to_string()),
        })
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceRef::Id(id) => write!(f, "{}", id),
            ServiceRef::Name(name) => f.write_str(name),
        }
    }
}

impl Serialize for ServiceRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ServiceRef::Id(id) => serializer.serialize_i64(*id),
            ServiceRef::Name(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for ServiceRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(i64),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(ServiceRef::Id(id)),
            Raw::Name(name) => Ok(name.parse().unwrap_or(ServiceRef::Name(name))),
        }
    }
}

/// Table names for one service: a list or a comma-separated string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Components {
    List(Vec<String>),
    Csv(String),
}

impl Components {
    /// Trimmed, non-empty, de-duplicated names in first-seen order.
    pub fn names(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Components::List(v) => v.iter().map(String::as_str).collect(),
            Components::Csv(s) => s.split(',').collect(),
        };
        let mut out: Vec<String> = Vec::with_capacity(raw.len());
        for name in raw.into_iter().map(str::trim).filter(|n| !n.is_empty()) {
            if !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        }
        out
    }
}

/// Which services and which schema components to include in an export.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSelection {
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    /// Service reference (id or name) -> table names.
    #[serde(default)]
    pub schemas: BTreeMap<String, Components>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(flatten)]
    pub selection: ExportSelection,
    #[serde(default = "default_true")]
    pub include_files: bool,
    #[serde(default)]
    pub include_data: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            selection: ExportSelection::default(),
            include_files: true,
            include_data: false,
        }
    }
}
