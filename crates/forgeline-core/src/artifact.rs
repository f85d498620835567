//! Archive extraction abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A file extracted from a package archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedArtifact {
    /// Name of the archive entry.
    pub entry: String,
    /// Where the entry was written.
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the written bytes.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{entry} not found in {}", .archive.display())]
    EntryNotFound { archive: PathBuf, entry: String },

    #[error("invalid archive {}: {message}", .archive.display())]
    InvalidArchive { archive: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for extracting a single entry out of an intermediate package.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Stream the entry named exactly `entry` into `destination`.
    ///
    /// If no such entry exists, fails with [`ExtractError::EntryNotFound`] and
    /// `destination` is not created.
    async fn extract(
        &self,
        archive: &Path,
        entry: &str,
        destination: &Path,
    ) -> Result<ExtractedArtifact, ExtractError>;
}
