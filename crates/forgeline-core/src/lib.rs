//! Core domain types and traits for the Forgeline build worker.
//!
//! This crate contains:
//! - Job identifiers, job records and the status transition graph
//! - The job queue trait and its change-notification types
//! - The process runner trait used by pipeline stages
//! - The archive extractor trait and artifact types
//! - Pipeline stage definitions and structured stage failures

pub mod artifact;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod queue;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{ArtifactUrls, Job, JobStatus};
