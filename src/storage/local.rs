//! Local file storage: containers are directories under a root directory.

use super::{join_key, unpacked_name, StorageBridge};
use crate::error::AppError;
use crate::package::archive::{validate_entry_name, PackageArchive};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const LOCAL_STORAGE_TYPE: &str = "local_file";

#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    root: PathBuf,
}

fn io_error(path: &Path, e: std::io::Error) -> AppError {
    match e.kind() {
        ErrorKind::PermissionDenied => AppError::Forbidden(format!("{}: {}", path.display(), e)),
        ErrorKind::NotFound => AppError::NotFound(format!("{}: {}", path.display(), e)),
        _ => AppError::Internal(format!("{}: {}", path.display(), e)),
    }
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFileStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `root/<relative>` for a relative, non-escaping path.
    fn resolve(&self, relative: &str) -> Result<PathBuf, AppError> {
        if relative.is_empty() {
            return Ok(self.root.clone());
        }
        validate_entry_name(relative).map_err(|e| AppError::BadRequest(e.to_string()))?;
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageBridge for LocalFileStorage {
    async fn container_exists(&self, container: &str) -> Result<bool, AppError> {
        if container.is_empty() {
            return Ok(false);
        }
        let path = self.resolve(container)?;
        Ok(tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn folder_exists(&self, container: &str, folder: &str) -> Result<bool, AppError> {
        if container.is_empty() {
            return Ok(false);
        }
        let path = self.resolve(&join_key(&[container, folder]))?;
        Ok(tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn pack_folder(
        &self,
        container: &str,
        folder: &str,
        archive: &mut PackageArchive,
        entry_root: &str,
    ) -> Result<usize, AppError> {
        let base = self.resolve(&join_key(&[container, folder]))?;
        let walk_base = base.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<Vec<(String, PathBuf)>, AppError> {
            let mut files = Vec::new();
            for entry in WalkDir::new(&walk_base).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| walk_base.clone());
                    match e.into_io_error() {
                        Some(io) => io_error(&path, io),
                        None => AppError::Internal(format!("cannot walk {}", path.display())),
                    }
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&walk_base)
                    .map_err(|e| AppError::Internal(e.to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((relative, entry.path().to_path_buf()));
            }
            Ok(files)
        })
        .await
        .map_err(|e| AppError::Internal(format!("file walk task failed: {}", e)))??;

        for (relative, path) in &files {
            let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
            archive.write_entry(&join_key(&[entry_root, relative]), bytes)?;
        }
        tracing::debug!(base = %base.display(), files = files.len(), "packed folder");
        Ok(files.len())
    }

    async fn unpack_archive(
        &self,
        container: &str,
        folder: &str,
        archive: &mut PackageArchive,
        strip_prefix: Option<&str>,
    ) -> Result<usize, AppError> {
        let base = self.resolve(&join_key(&[container, folder]))?;
        let mut written = 0;
        for (name, bytes) in archive.drain_entries() {
            let relative = match unpacked_name(&name, strip_prefix) {
                Some(r) => r,
                None => continue,
            };
            validate_entry_name(relative).map_err(|e| AppError::BadRequest(e.to_string()))?;
            let target = base.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
            }
            tokio::fs::write(&target, bytes).await.map_err(|e| io_error(&target, e))?;
            written += 1;
        }
        tracing::debug!(base = %base.display(), files = written, "unpacked archive");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::archive::Backing;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    #[tokio::test]
    async fn packs_container_folder_under_entry_root() {
        let root = TempDir::new().unwrap();
        write(root.path(), "applications/todo/index.html", "<html/>");
        write(root.path(), "applications/todo/js/app.js", "x");
        write(root.path(), "applications/other/skip.txt", "no");
        let storage = LocalFileStorage::new(root.path());
        assert!(storage.container_exists("applications").await.unwrap());
        assert!(storage.folder_exists("applications", "todo").await.unwrap());
        assert!(!storage.folder_exists("applications", "nope").await.unwrap());

        let scratch = TempDir::new().unwrap();
        let mut archive = PackageArchive::create(Backing::Borrowed(scratch.path().join("a.dfpkg"))).unwrap();
        let n = storage.pack_folder("applications", "todo", &mut archive, "todo").await.unwrap();
        assert_eq!(n, 2);
        let names: Vec<&str> = archive.entry_names().collect();
        assert_eq!(names, vec!["todo/index.html", "todo/js/app.js"]);
    }

    #[tokio::test]
    async fn unpack_strips_prefix_and_consumes_entries() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut archive = PackageArchive::create(Backing::Borrowed(scratch.path().join("a.dfpkg"))).unwrap();
        archive.write_entry("todo/index.html", b"<html/>".to_vec()).unwrap();
        archive.write_entry("todo/css/site.css", b"body{}".to_vec()).unwrap();

        let storage = LocalFileStorage::new(root.path());
        let n = storage.unpack_archive("todo", "", &mut archive, Some("todo/")).await.unwrap();
        assert_eq!(n, 2);
        assert!(archive.is_empty());
        assert_eq!(std::fs::read_to_string(root.path().join("todo/index.html")).unwrap(), "<html/>");
        assert!(root.path().join("todo/css/site.css").exists());
    }

    #[tokio::test]
    async fn container_names_cannot_escape_root() {
        let root = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(root.path());
        assert!(matches!(storage.container_exists("../etc").await, Err(AppError::BadRequest(_))));
    }
}
