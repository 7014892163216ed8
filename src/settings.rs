//! Packager settings from environment (`PACKAGER_*`). Binaries call `dotenvy::dotenv()` first so a `.env` file applies.

use crate::bridge::ResourceEnvelope;
use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RESOURCE_WRAPPER: &str = "resource";
/// Folder used for imported app files when the descriptor names no storage container.
pub const DEFAULT_STORAGE_FOLDER: &str = "applications";
/// Service type of the platform's default file storage.
pub const DEFAULT_STORAGE_TYPE: &str = "local_file";
const DEFAULT_MAX_PACKAGE_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_UNPACKED_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct PackagerSettings {
    /// Key wrapping record arrays in bridge payloads, e.g. `{"resource": [...]}`.
    pub resource_wrapper: String,
    pub always_wrap_resources: bool,
    /// Where export archives are built and uploads/downloads are materialized.
    pub temp_dir: PathBuf,
    pub default_storage_folder: String,
    pub default_storage_type: String,
    /// Root directory for `local_file` storage services without an explicit `config.root`.
    pub storage_root: PathBuf,
    pub max_package_bytes: usize,
    /// Total inflated size of all archive entries; larger packages are rejected on open.
    pub max_unpacked_bytes: u64,
    pub fetch_timeout: Duration,
}

impl Default for PackagerSettings {
    fn default() -> Self {
        PackagerSettings {
            resource_wrapper: DEFAULT_RESOURCE_WRAPPER.into(),
            always_wrap_resources: true,
            temp_dir: std::env::temp_dir(),
            default_storage_folder: DEFAULT_STORAGE_FOLDER.into(),
            default_storage_type: DEFAULT_STORAGE_TYPE.into(),
            storage_root: PathBuf::from("./storage"),
            max_package_bytes: DEFAULT_MAX_PACKAGE_BYTES,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

impl PackagerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset or empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = PackagerSettings::default();

        if let Some(v) = get("PACKAGER_RESOURCE_WRAPPER") {
            settings.resource_wrapper = v;
        }
        if let Some(v) = get("PACKAGER_ALWAYS_WRAP") {
            settings.always_wrap_resources = parse_bool("PACKAGER_ALWAYS_WRAP", &v)?;
        }
        if let Some(v) = get("PACKAGER_TEMP_DIR") {
            settings.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PACKAGER_DEFAULT_STORAGE_FOLDER") {
            settings.default_storage_folder = v;
        }
        if let Some(v) = get("PACKAGER_DEFAULT_STORAGE_TYPE") {
            settings.default_storage_type = v;
        }
        if let Some(v) = get("PACKAGER_STORAGE_ROOT") {
            settings.storage_root = PathBuf::from(v);
        }
        if let Some(v) = get("PACKAGER_MAX_PACKAGE_BYTES") {
            settings.max_package_bytes = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PACKAGER_MAX_PACKAGE_BYTES",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("PACKAGER_MAX_UNPACKED_BYTES") {
            settings.max_unpacked_bytes = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PACKAGER_MAX_UNPACKED_BYTES",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("PACKAGER_FETCH_TIMEOUT_SECS") {
            let secs: u64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PACKAGER_FETCH_TIMEOUT_SECS",
                value: v.clone(),
            })?;
            settings.fetch_timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }

    pub fn envelope(&self) -> ResourceEnvelope {
        ResourceEnvelope::new(&self.resource_wrapper, self.always_wrap_resources)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let s = PackagerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s.resource_wrapper, "resource");
        assert!(s.always_wrap_resources);
        assert_eq!(s.default_storage_folder, "applications");
        assert_eq!(s.default_storage_type, "local_file");
        assert_eq!(s.max_package_bytes, 64 * 1024 * 1024);
        assert_eq!(s.max_unpacked_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn overrides_from_lookup() {
        let s = PackagerSettings::from_lookup(lookup(&[
            ("PACKAGER_RESOURCE_WRAPPER", "records"),
            ("PACKAGER_ALWAYS_WRAP", "no"),
            ("PACKAGER_MAX_PACKAGE_BYTES", "1024"),
            ("PACKAGER_MAX_UNPACKED_BYTES", "4096"),
            ("PACKAGER_FETCH_TIMEOUT_SECS", "5"),
            ("PACKAGER_DEFAULT_STORAGE_FOLDER", "  "),
        ]))
        .unwrap();
        assert_eq!(s.resource_wrapper, "records");
        assert!(!s.always_wrap_resources);
        assert_eq!(s.max_package_bytes, 1024);
        assert_eq!(s.max_unpacked_bytes, 4096);
        assert_eq!(s.fetch_timeout, Duration::from_secs(5));
        assert_eq!(s.default_storage_folder, "applications");
    }

    #[test]
    fn rejects_invalid_numbers_and_flags() {
        let err = PackagerSettings::from_lookup(lookup(&[("PACKAGER_MAX_PACKAGE_BYTES", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PACKAGER_MAX_PACKAGE_BYTES", .. }));
        let err = PackagerSettings::from_lookup(lookup(&[("PACKAGER_ALWAYS_WRAP", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PACKAGER_ALWAYS_WRAP", .. }));
    }
}
