//! Per-job workspace directories.

use forgeline_core::{Error, JobId, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory under which every job gets `<root>/<job-id>`.
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute workspace path of a job. Stage arguments carry absolute paths
    /// because stages run in different working directories.
    pub fn path_for(&self, id: JobId) -> Result<PathBuf> {
        std::path::absolute(self.root.join(id.to_string()))
            .map_err(|e| Error::Workspace(format!("cannot resolve workspace for {}: {}", id, e)))
    }

    /// Create an empty workspace for `id`.
    ///
    /// Anything left at that path by an earlier run is removed first.
    pub async fn prepare(&self, id: JobId) -> Result<PathBuf> {
        let path = self.path_for(id)?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "Removing stale workspace");
            remove_dir(&path).await?;
        }

        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            Error::Workspace(format!("cannot create {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Created workspace");
        Ok(path)
    }

    /// Remove the workspace of `id`. A workspace that does not exist is fine.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        let path = self.path_for(id)?;
        remove_dir(&path).await?;
        debug!(path = %path.display(), "Removed workspace");
        Ok(())
    }
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Workspace(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}
