//! Attachment byte storage.
//!
//! The relational store keeps only file references; bytes live behind the
//! [`FileStore`] seam. Byte storage is not transactional, so callers unlink
//! bytes only once the owning reference row's delete is durable.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors from file storage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("file storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The filename is empty or contains path separators.
    #[error("invalid file name: '{0}'")]
    InvalidName(String),
}

/// A stored file reference, relative to the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef(pub String);

/// Storage collaborator for attachment bytes.
pub trait FileStore: Send + Sync {
    /// Stores raw bytes under a fresh reference derived from `filename`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the write fails.
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<FileRef, StorageError>;

    /// Removes the stored bytes. Removing a reference that no longer has
    /// bytes is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails for a reason other than the
    /// file already being gone.
    fn delete(&self, file_ref: &FileRef) -> Result<(), StorageError>;
}

/// Files on the local filesystem under a media root.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Creates a store rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileStore for LocalFileStore {
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<FileRef, StorageError> {
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return Err(StorageError::InvalidName(filename.to_string()));
        }
        fs::create_dir_all(&self.root)?;
        let stored_name = format!("{}-{filename}", Uuid::new_v4());
        fs::write(self.root.join(&stored_name), bytes)?;
        debug!(stored_name, size = bytes.len(), "stored attachment bytes");
        Ok(FileRef(stored_name))
    }

    fn delete(&self, file_ref: &FileRef) -> Result<(), StorageError> {
        match fs::remove_file(self.root.join(&file_ref.0)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(file_ref = %file_ref.0, "bytes already gone");
                Ok(())
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let file_ref = store.save("report.pdf", b"content").unwrap();
        assert!(file_ref.0.ends_with("-report.pdf"));
        assert_eq!(
            std::fs::read(dir.path().join(&file_ref.0)).unwrap(),
            b"content"
        );

        store.delete(&file_ref).unwrap();
        assert!(!dir.path().join(&file_ref.0).exists());
    }

    #[test]
    fn deleting_missing_bytes_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        store.delete(&FileRef("nope".to_string())).unwrap();
    }

    #[test]
    fn rejects_path_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(matches!(
            store.save("../evil", b"x"),
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            store.save("", b"x"),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn same_filename_gets_distinct_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let a = store.save("dup.txt", b"a").unwrap();
        let b = store.save("dup.txt", b"b").unwrap();
        assert_ne!(a, b);
    }
}
