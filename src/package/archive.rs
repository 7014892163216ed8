//! Package archive accessor. A zip container is loaded into memory on open, read and mutated
//! by entry name, and written back to its backing file on `finish`. An owned backing file is
//! removed when the archive (or its backing) is dropped, on every exit path.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// File extension of user-facing package archives.
pub const PACKAGE_EXTENSION: &str = "dfpkg";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("invalid package archive {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("archive io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write package archive {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("invalid archive entry name: '{0}'")]
    InvalidEntryName(String),
}

/// Backing file of an archive. `Owned` files were created by this crate (export builds,
/// materialized uploads and downloads) and are deleted on drop; `Borrowed` files are left alone.
#[derive(Debug)]
pub enum Backing {
    Owned(PathBuf),
    Borrowed(PathBuf),
}

impl Backing {
    pub fn path(&self) -> &Path {
        match self {
            Backing::Owned(p) | Backing::Borrowed(p) => p,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Backing::Owned(_))
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Owned(path) = self {
            match std::fs::remove_file(&*path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed package temp file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove package temp file"),
            }
        }
    }
}

struct Entry {
    name: String,
    bytes: Vec<u8>,
}

/// Ordered, named-entry package container.
///
/// Reads come in two forms: [`peek_entry`](Self::peek_entry) leaves the entry in place, while
/// [`take_entry`](Self::take_entry) removes it so later phases (file unpacking in particular)
/// only see what has not been consumed yet.
pub struct PackageArchive {
    backing: Backing,
    entries: Vec<Entry>,
    compression: CompressionMethod,
}

impl std::fmt::Debug for PackageArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageArchive")
            .field("backing", &self.backing)
            .field("entries", &self.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl PackageArchive {
    /// Open an existing archive. Fails fast with [`ArchiveError::Invalid`] when the file is not a
    /// readable zip container or holds an entry that would escape its extraction root.
    pub fn open(backing: Backing) -> Result<Self, ArchiveError> {
        Self::open_limited(backing, u64::MAX)
    }

    /// Like [`open`](Self::open), but fails with [`ArchiveError::Invalid`] once the entries
    /// inflate to more than `max_unpacked` bytes in total. Entry sizes claimed by the zip
    /// headers are not trusted.
    pub fn open_limited(backing: Backing, max_unpacked: u64) -> Result<Self, ArchiveError> {
        let path = backing.path().to_path_buf();
        let file = File::open(&path).map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;
        let invalid = |reason: String| ArchiveError::Invalid {
            path: path.clone(),
            reason,
        };
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| invalid(e.to_string()))?;

        let mut entries = Vec::with_capacity(zip.len());
        let mut unpacked: u64 = 0;
        for i in 0..zip.len() {
            let mut f = zip.by_index(i).map_err(|e| invalid(e.to_string()))?;
            if f.is_dir() {
                continue;
            }
            let name = f.name().to_string();
            validate_entry_name(&name).map_err(|e| invalid(e.to_string()))?;
            let remaining = max_unpacked.saturating_sub(unpacked);
            let mut bytes = Vec::new();
            (&mut f)
                .take(remaining.saturating_add(1))
                .read_to_end(&mut bytes)
                .map_err(|e| invalid(format!("entry '{}': {}", name, e)))?;
            unpacked += bytes.len() as u64;
            if unpacked > max_unpacked {
                return Err(invalid(format!(
                    "entries expand beyond the limit of {} bytes",
                    max_unpacked
                )));
            }
            entries.push(Entry { name, bytes });
        }
        tracing::debug!(path = %path.display(), entries = entries.len(), "opened package archive");

        Ok(PackageArchive {
            backing,
            entries,
            compression: CompressionMethod::Deflated,
        })
    }

    /// Create an empty archive. The backing file is created immediately so an unwritable
    /// location fails before any entries are assembled.
    pub fn create(backing: Backing) -> Result<Self, ArchiveError> {
        let path = backing.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        File::create(path).map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(PackageArchive {
            backing,
            entries: Vec::new(),
            compression: CompressionMethod::Deflated,
        })
    }

    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Read an entry without consuming it.
    pub fn peek_entry(&self, name: &str) -> Option<&[u8]> {
        self.position(name).map(|i| self.entries[i].bytes.as_slice())
    }

    /// Read and remove an entry.
    pub fn take_entry(&mut self, name: &str) -> Option<Vec<u8>> {
        self.position(name).map(|i| self.entries.remove(i).bytes)
    }

    /// Add an entry, replacing any entry of the same name in place.
    pub fn write_entry(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), ArchiveError> {
        validate_entry_name(name)?;
        match self.position(name) {
            Some(i) => self.entries[i].bytes = bytes,
            None => self.entries.push(Entry {
                name: name.to_string(),
                bytes,
            }),
        }
        Ok(())
    }

    pub fn delete_entry(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Remove and return every remaining entry, in archive order.
    pub fn drain_entries(&mut self) -> Vec<(String, Vec<u8>)> {
        self.entries.drain(..).map(|e| (e.name, e.bytes)).collect()
    }

    /// Write the current entries to the backing file as a zip container.
    pub fn finish(&self) -> Result<(), ArchiveError> {
        let path = self.path().to_path_buf();
        let write_err = |reason: String| ArchiveError::Write {
            path: path.clone(),
            reason,
        };
        let file = File::create(&path).map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(self.compression);
        for entry in &self.entries {
            zip.start_file(entry.name.as_str(), options)
                .map_err(|e| write_err(format!("entry '{}': {}", entry.name, e)))?;
            zip.write_all(&entry.bytes)
                .map_err(|e| write_err(format!("entry '{}': {}", entry.name, e)))?;
        }
        zip.finish().map_err(|e| write_err(e.to_string()))?;
        Ok(())
    }

    /// Release the archive; an owned backing file is deleted.
    pub fn close(self) {}

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }
}

/// Entry names are relative, `/`-separated and never climb out of their root.
pub fn validate_entry_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name.starts_with('/') || name.contains('\\') || name.contains('\0') {
        return Err(ArchiveError::InvalidEntryName(name.to_string()));
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ArchiveError::InvalidEntryName(name.to_string())),
        }
    }
    Ok(())
}
