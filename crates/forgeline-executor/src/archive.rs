//! Zip archive entry extraction.
//!
//! The universal package conversion writes an `.apks` file, which is a plain
//! zip archive. Only the requested entry is read; everything else in the
//! archive is ignored.

use async_trait::async_trait;
use forgeline_core::artifact::{ArchiveExtractor, ExtractError, ExtractedArtifact};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;
use zip::result::ZipError;

/// Extracts single entries from zip archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ZipExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveExtractor for ZipExtractor {
    async fn extract(
        &self,
        archive: &Path,
        entry: &str,
        destination: &Path,
    ) -> Result<ExtractedArtifact, ExtractError> {
        let archive = archive.to_path_buf();
        let entry = entry.to_string();
        let destination = destination.to_path_buf();

        // The zip reader is synchronous; keep it off the async workers.
        tokio::task::spawn_blocking(move || extract_entry(&archive, &entry, &destination))
            .await
            .map_err(|e| ExtractError::Io(io::Error::other(e)))?
    }
}

fn extract_entry(
    archive: &Path,
    entry: &str,
    destination: &Path,
) -> Result<ExtractedArtifact, ExtractError> {
    debug!(archive = %archive.display(), entry, "Opening archive");

    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .map_err(|e| invalid_archive(archive, e))?;

    let mut source = match zip.by_name(entry) {
        Ok(source) => source,
        Err(ZipError::FileNotFound) => {
            return Err(ExtractError::EntryNotFound {
                archive: archive.to_path_buf(),
                entry: entry.to_string(),
            });
        }
        Err(e) => return Err(invalid_archive(archive, e)),
    };

    let mut sink = HashingWriter::new(BufWriter::new(File::create(destination)?));
    let copied = io::copy(&mut source, &mut sink).and_then(|_| sink.flush());

    if let Err(e) = copied {
        let _ = std::fs::remove_file(destination);
        return Err(ExtractError::Io(e));
    }

    let (size, checksum) = sink.finish();
    info!(
        entry,
        destination = %destination.display(),
        size,
        checksum = %checksum,
        "Extracted archive entry"
    );

    Ok(ExtractedArtifact {
        entry: entry.to_string(),
        path: PathBuf::from(destination),
        checksum,
        size,
    })
}

fn invalid_archive(archive: &Path, error: ZipError) -> ExtractError {
    ExtractError::InvalidArchive {
        archive: archive.to_path_buf(),
        message: error.to_string(),
    }
}

/// Writer that hashes and counts everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (u64, String) {
        (self.written, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
