//! Storage locations for instructions
//!
//! The conductor locates one [`Storage`] per instruction path through a
//! [`StorageConfiguration`]. The root storage additionally holds the
//! persisted procedure definition.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::path::ExperimentPath;

/// Allocated storage for one experiment path
pub trait Storage: Send + Sync + fmt::Debug {
    /// Location of the storage
    fn location(&self) -> &Path;

    /// Write a named entry
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn write(&self, name: &str, contents: &[u8]) -> io::Result<()>;

    /// Remove a named entry, succeeding if it does not exist
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn remove(&self, name: &str) -> io::Result<()>;

    /// Release the storage and everything beneath it
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn deallocate(&self) -> io::Result<()>;
}

/// Locates storage for experiment paths
pub trait StorageConfiguration: Send + Sync {
    /// Locate (allocating if needed) the storage for a path
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn locate_storage(&self, path: &ExperimentPath) -> io::Result<Box<dyn Storage>>;
}

/// Directory-per-path storage under a root directory
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Create storage rooted at a directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageConfiguration for FileSystemStorage {
    fn locate_storage(&self, path: &ExperimentPath) -> io::Result<Box<dyn Storage>> {
        if !path.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot locate storage for relative path {path}"),
            ));
        }
        let directory = path.ids().iter().fold(self.root.clone(), |dir, id| dir.join(id));
        fs::create_dir_all(&directory)?;
        Ok(Box::new(Directory { directory }))
    }
}

#[derive(Debug)]
struct Directory {
    directory: PathBuf,
}

impl Storage for Directory {
    fn location(&self) -> &Path {
        &self.directory
    }

    fn write(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.directory)?;
        fs::write(self.directory.join(name), contents)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.directory.join(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn deallocate(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.directory) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locates_nested_directories() {
        let root = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(root.path());
        let located = storage
            .locate_storage(&"/holder/a".parse().unwrap())
            .unwrap();
        assert_eq!(located.location(), root.path().join("holder").join("a"));
        assert!(located.location().is_dir());

        located.write("data.json", b"{}").unwrap();
        assert!(located.location().join("data.json").is_file());
        located.remove("data.json").unwrap();
        located.remove("data.json").unwrap();
    }

    #[test]
    fn test_deallocate_removes_subtree() {
        let root = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(root.path());
        let holder = storage.locate_storage(&"/holder".parse().unwrap()).unwrap();
        let child = storage.locate_storage(&"/holder/a".parse().unwrap()).unwrap();
        child.write("spectrum", b"1 2 3").unwrap();

        holder.deallocate().unwrap();
        assert!(!root.path().join("holder").exists());
        holder.deallocate().unwrap();
    }

    #[test]
    fn test_rejects_relative_path() {
        let root = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(root.path());
        let error = storage.locate_storage(&"../x".parse().unwrap()).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }
}
