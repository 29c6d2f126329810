//! Removal of uploaded files when a create or update is rolled back.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::core::request::UploadedFile;
use crate::errors::CrudError;

/// Where uploaded files live.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Delete the stored copy of `file`. A file that is already gone is not
    /// an error.
    async fn delete(&self, file: &UploadedFile) -> Result<(), CrudError>;
}

/// Files stored under a root directory; `UploadedFile::path` is relative to
/// it.
#[derive(Debug, Clone)]
pub struct LocalDiskStore {
    root: PathBuf,
}

impl LocalDiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the process's working directory; used for cleanup when
    /// a resource configures no store.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the working directory cannot be read.
    pub fn working_dir() -> Result<Self, CrudError> {
        std::env::current_dir()
            .map(Self::new)
            .map_err(|e| CrudError::storage(format!("no working directory: {e}")))
    }

    /// Join `path` under the root. Returns `None` when it would leave the
    /// root.
    #[must_use]
    pub fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }
}

#[async_trait]
impl BlobStore for LocalDiskStore {
    async fn delete(&self, file: &UploadedFile) -> Result<(), CrudError> {
        let Some(path) = &file.path else {
            return Ok(());
        };
        let resolved = self.resolve_path(path).ok_or_else(|| {
            CrudError::storage(format!("'{}' is outside the upload directory", path.display()))
        })?;
        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => {
                tracing::debug!(path = %resolved.display(), "removed uploaded file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CrudError::storage(format!(
                "failed to remove '{}': {e}",
                resolved.display()
            ))),
        }
    }
}

/// Delete every file, logging failures instead of returning them.
pub async fn discard_uploads(store: &dyn BlobStore, files: &[UploadedFile]) {
    for file in files {
        if let Err(e) = store.delete(file).await {
            tracing::warn!(file = %file.original_name, error = %e, "failed to clean up upload");
        }
    }
}
