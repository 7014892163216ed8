//! Package validation: import file extension, export selection normalization, safe file names.

use crate::error::AppError;
use crate::package::archive::PACKAGE_EXTENSION;
use crate::package::types::{ExportSelection, ServiceRef};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Accept only names ending in `.dfpkg` (case-insensitive). Runs before any archive is opened.
pub fn check_package_extension(name: &str) -> Result<(), AppError> {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if extension != PACKAGE_EXTENSION {
        return Err(AppError::BadRequest(format!(
            "Only package files ending with '{}' are allowed for import.",
            PACKAGE_EXTENSION
        )));
    }
    Ok(())
}

/// One service's requested schema components, after normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaSelection {
    pub service: ServiceRef,
    pub tables: Vec<String>,
}

/// Services to export, de-duplicated in request order.
pub fn service_selections(selection: &ExportSelection) -> Vec<ServiceRef> {
    let mut out: Vec<ServiceRef> = Vec::with_capacity(selection.services.len());
    for r in &selection.services {
        if matches!(r, ServiceRef::Name(n) if n.is_empty()) {
            continue;
        }
        if !out.contains(r) {
            out.push(r.clone());
        }
    }
    out
}

/// Schema selections with at least one component; entries without components are dropped.
pub fn schema_selections(selection: &ExportSelection) -> Vec<SchemaSelection> {
    selection
        .schemas
        .iter()
        .filter_map(|(service, components)| {
            let tables = components.names();
            let service: ServiceRef = service.parse().ok()?;
            if tables.is_empty() || matches!(&service, ServiceRef::Name(n) if n.is_empty()) {
                None
            } else {
                Some(SchemaSelection { service, tables })
            }
        })
        .collect()
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid file-stem pattern"))
}

/// File-system and header safe stem for an application name.
pub fn sanitize_file_stem(name: &str) -> String {
    let cleaned = unsafe_chars().replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        "application".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::types::Components;
    use std::collections::BTreeMap;

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(check_package_extension("todo.dfpkg").is_ok());
        assert!(check_package_extension("TODO.DFPKG").is_ok());
        assert!(check_package_extension("/tmp/uploads/todo.dfpkg").is_ok());
    }

    #[test]
    fn wrong_extension_is_a_bad_request() {
        for name in ["archive.zip", "archive", "archive.dfpkg.zip", ""] {
            assert!(
                matches!(check_package_extension(name), Err(AppError::BadRequest(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn schema_selections_drop_empty_components() {
        let mut schemas = BTreeMap::new();
        schemas.insert("db1".to_string(), Components::List(vec!["orders".into(), "customers".into()]));
        schemas.insert("7".to_string(), Components::Csv("items".into()));
        schemas.insert("db2".to_string(), Components::List(vec![]));
        let selection = ExportSelection {
            services: vec![],
            schemas,
        };
        let out = schema_selections(&selection);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].service, ServiceRef::Id(7));
        assert_eq!(out[1].service, ServiceRef::Name("db1".into()));
        assert_eq!(out[1].tables, vec!["orders", "customers"]);
    }

    #[test]
    fn service_selections_dedupe() {
        let selection = ExportSelection {
            services: vec![
                ServiceRef::Name("mail".into()),
                ServiceRef::Id(3),
                ServiceRef::Name("mail".into()),
                ServiceRef::Name(String::new()),
            ],
            schemas: BTreeMap::new(),
        };
        assert_eq!(service_selections(&selection), vec![ServiceRef::Name("mail".into()), ServiceRef::Id(3)]);
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("todo"), "todo");
        assert_eq!(sanitize_file_stem("My App/../x"), "My_App_.._x");
        assert_eq!(sanitize_file_stem("\"quoted\""), "quoted");
        assert_eq!(sanitize_file_stem("///"), "application");
    }
}
