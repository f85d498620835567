//! Execution backends for Forgeline pipeline stages.
//!
//! Provides:
//! - A local process runner (tokio child processes)
//! - A zip archive entry extractor

pub mod archive;
pub mod local;

pub use archive::ZipExtractor;
pub use forgeline_core::artifact::{ArchiveExtractor, ExtractError, ExtractedArtifact};
pub use forgeline_core::executor::{
    LogLine, LogStream, ProcessOutcome, ProcessRunner, ProcessSpec,
};
pub use local::LocalProcessRunner;
