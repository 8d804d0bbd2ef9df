//! Staging of caller-supplied files on the host.
//!
//! Each sandbox gets its own scratch directory under the staging root. The
//! directory is bind-mounted into the container, read-only unless the
//! request asked for a writable workspace.

use std::path::{Path, PathBuf};

use mcp_sandbox_core::{Error, Result, SandboxId};

use crate::validator::ValidatedFile;

/// Scratch directory owned by one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingHandle {
    root: PathBuf,
    read_only: bool,
}

impl StagingHandle {
    /// Host path to mount into the container.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }
}

pub struct FileStager {
    root: PathBuf,
}

impl FileStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write `files` into a fresh directory for `id`.
    ///
    /// On failure, whatever was written is removed before the error is
    /// returned.
    pub async fn stage(
        &self,
        id: &SandboxId,
        files: &[ValidatedFile],
        writable: bool,
    ) -> Result<StagingHandle> {
        // The id becomes a single path component below the root
        id.validate()?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::staging(&self.root, e))?;

        let handle = StagingHandle {
            root: self.root.join(id.as_str()),
            read_only: !writable,
        };

        // create_dir (not _all): an existing directory means another sandbox
        // owns it.
        tokio::fs::create_dir(&handle.root)
            .await
            .map_err(|e| Error::staging(&handle.root, e))?;

        if let Err(e) = write_files(&handle.root, files).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Staging failed, removing partial files");
            self.cleanup(&handle).await;
            return Err(e);
        }

        tracing::debug!(
            sandbox_id = %id,
            root = %handle.root.display(),
            files = files.len(),
            read_only = handle.read_only,
            "Files staged"
        );
        Ok(handle)
    }

    /// Remove the staging directory. Safe to call repeatedly.
    pub async fn cleanup(&self, handle: &StagingHandle) {
        match tokio::fs::remove_dir_all(&handle.root).await {
            Ok(()) => {
                tracing::debug!(root = %handle.root.display(), "Staging directory removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    root = %handle.root.display(),
                    error = %e,
                    "Failed to remove staging directory"
                );
            }
        }
    }
}

async fn write_files(root: &Path, files: &[ValidatedFile]) -> Result<()> {
    for file in files {
        let target = root.join(file.path());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::staging(parent, e))?;
        }
        tokio::fs::write(&target, file.content())
            .await
            .map_err(|e| Error::staging(&target, e))?;
    }
    Ok(())
}
