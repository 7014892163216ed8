//! Package sources: uploads, URLs and local paths, validated and opened as archives.
//!
//! The package extension is checked before any byte is written or fetched. Uploads and
//! downloads are materialized as owned temp files, removed when the archive is dropped.

use crate::error::AppError;
use crate::package::archive::{Backing, PackageArchive, PACKAGE_EXTENSION};
use crate::package::validator::check_package_extension;
use crate::settings::PackagerSettings;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum PackageSource {
    /// Uploaded package; `file_name` is the client-side name.
    Upload { file_name: String, bytes: Vec<u8> },
    Url(String),
    /// Package already on local disk; left in place.
    Path(PathBuf),
}

impl PackageSource {
    fn describe(&self) -> String {
        match self {
            PackageSource::Upload { file_name, .. } => format!("upload '{}'", file_name),
            PackageSource::Url(url) => format!("url '{}'", url),
            PackageSource::Path(path) => format!("path '{}'", path.display()),
        }
    }
}

fn temp_package_path(settings: &PackagerSettings) -> PathBuf {
    settings
        .temp_dir
        .join(format!("{}.{}", Uuid::new_v4(), PACKAGE_EXTENSION))
}

fn too_large(settings: &PackagerSettings) -> AppError {
    AppError::BadRequest(format!(
        "package exceeds the maximum size of {} bytes",
        settings.max_package_bytes
    ))
}

async fn open_backing(backing: Backing, settings: &PackagerSettings) -> Result<PackageArchive, AppError> {
    let max_unpacked = settings.max_unpacked_bytes;
    tokio::task::spawn_blocking(move || PackageArchive::open_limited(backing, max_unpacked))
        .await
        .map_err(|e| AppError::Internal(format!("archive open task failed: {}", e)))?
        .map_err(AppError::from)
}

async fn materialize(bytes: &[u8], settings: &PackagerSettings) -> Result<Backing, AppError> {
    tokio::fs::create_dir_all(&settings.temp_dir)
        .await
        .map_err(|e| AppError::Internal(format!("cannot create temp dir {}: {}", settings.temp_dir.display(), e)))?;
    let backing = Backing::Owned(temp_package_path(settings));
    tokio::fs::write(backing.path(), bytes)
        .await
        .map_err(|e| AppError::Internal(format!("cannot write {}: {}", backing.path().display(), e)))?;
    Ok(backing)
}

/// Validate a source and open it as a package archive.
pub async fn open_source(
    source: PackageSource,
    settings: &PackagerSettings,
    http: &reqwest::Client,
) -> Result<PackageArchive, AppError> {
    tracing::info!(source = %source.describe(), "opening package");
    match source {
        PackageSource::Upload { file_name, bytes } => {
            check_package_extension(&file_name)?;
            if bytes.len() > settings.max_package_bytes {
                return Err(too_large(settings));
            }
            let backing = materialize(&bytes, settings).await?;
            open_backing(backing, settings).await
        }
        PackageSource::Url(url) => {
            let parsed = reqwest::Url::parse(&url)
                .map_err(|e| AppError::BadRequest(format!("invalid package url '{}': {}", url, e)))?;
            check_package_extension(parsed.path())?;
            let bytes = fetch(&url, parsed, settings, http).await?;
            let backing = materialize(&bytes, settings).await?;
            open_backing(backing, settings).await
        }
        PackageSource::Path(path) => {
            check_package_extension(&path.to_string_lossy())?;
            open_backing(Backing::Borrowed(path), settings).await
        }
    }
}

async fn fetch(
    url: &str,
    parsed: reqwest::Url,
    settings: &PackagerSettings,
    http: &reqwest::Client,
) -> Result<Vec<u8>, AppError> {
    let failed = |e: &dyn std::fmt::Display| AppError::Internal(format!("Failed to import package {}.\n{}", url, e));
    let mut response = http
        .get(parsed)
        .timeout(settings.fetch_timeout)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| failed(&e))?;
    if response
        .content_length()
        .map(|len| len as usize > settings.max_package_bytes)
        .unwrap_or(false)
    {
        return Err(too_large(settings));
    }
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| failed(&e))? {
        if bytes.len() + chunk.len() > settings.max_package_bytes {
            return Err(too_large(settings));
        }
        bytes.extend_from_slice(&chunk);
    }
    tracing::debug!(url, bytes = bytes.len(), "downloaded package");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::archive::ArchiveError;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> PackagerSettings {
        PackagerSettings {
            temp_dir: dir.path().to_path_buf(),
            max_package_bytes: 1024,
            ..PackagerSettings::default()
        }
    }

    #[tokio::test]
    async fn wrong_extension_is_rejected_before_anything_is_written() {
        let dir = TempDir::new().unwrap();
        let source = PackageSource::Upload {
            file_name: "archive.zip".into(),
            bytes: b"PK".to_vec(),
        };
        let err = open_source(source, &settings(&dir), &reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let source = PackageSource::Upload {
            file_name: "big.dfpkg".into(),
            bytes: vec![0; 2048],
        };
        let err = open_source(source, &settings(&dir), &reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn corrupt_upload_fails_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let source = PackageSource::Upload {
            file_name: "todo.dfpkg".into(),
            bytes: b"not a zip".to_vec(),
        };
        let err = open_source(source, &settings(&dir), &reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn package_inflating_past_the_limit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(&build).unwrap();
        let path = build.join("bomb.dfpkg");
        let mut archive = PackageArchive::create(Backing::Borrowed(path.clone())).unwrap();
        archive
            .write_entry("description.json", br#"{"name":"todo"}"#.to_vec())
            .unwrap();
        archive.write_entry("todo/zeros.bin", vec![0; 4 * 1024 * 1024]).unwrap();
        archive.finish().unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let tmp = dir.path().join("tmp");
        let settings = PackagerSettings {
            temp_dir: tmp.clone(),
            max_package_bytes: 1024 * 1024,
            max_unpacked_bytes: 1024 * 1024,
            ..PackagerSettings::default()
        };
        assert!(bytes.len() < settings.max_package_bytes);

        let source = PackageSource::Upload {
            file_name: "bomb.dfpkg".into(),
            bytes,
        };
        let err = open_source(source, &settings, &reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Archive(ArchiveError::Invalid { .. })));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn url_extension_is_checked_on_the_path() {
        let dir = TempDir::new().unwrap();
        let source = PackageSource::Url("http://127.0.0.1:9/pkg.zip?name=x.dfpkg".into());
        let err = open_source(source, &settings(&dir), &reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
