//! Job queue abstraction.
//!
//! The queue is the one piece of state shared by every job processor. It is
//! only ever mutated through the conditional transitions below, which makes a
//! claim safe under duplicate delivery of the same notification.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{ArtifactUrls, Job, JobId, JobStatus, Result};

/// Result of an attempt to claim a job.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The job moved from `queued` to `building`; the caller owns it.
    Claimed(Job),
    /// No job with this id exists.
    NotFound,
    /// The job exists but was no longer `queued` at write time.
    NotQueued(JobStatus),
}

/// Kind of change in the queued view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A job entered the queued view.
    Added,
    /// A job in the queued view was modified but is still queued.
    Modified,
    /// A job left the queued view (claimed, finished or deleted).
    Removed,
}

/// A change notification for the queued view.
#[derive(Debug, Clone)]
pub struct JobChange {
    pub kind: ChangeKind,
    pub job_id: JobId,
    /// Snapshot of the job at notification time, if it still exists.
    pub job: Option<Job>,
}

impl JobChange {
    pub fn added(job: Job) -> Self {
        Self {
            kind: ChangeKind::Added,
            job_id: job.id,
            job: Some(job),
        }
    }
}

/// Stream of queued-view changes. Ends when the subscription is closed.
pub type ChangeStream = BoxStream<'static, Result<JobChange>>;

/// Trait for job queue backends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically move a job from `queued` to `building`.
    async fn claim(&self, id: JobId) -> Result<ClaimOutcome>;

    /// Move a `building` job to `success` and record its artifact URLs.
    ///
    /// Fails with [`crate::Error::Conflict`] if the job is not `building`.
    async fn mark_succeeded(&self, id: JobId, artifacts: &ArtifactUrls) -> Result<()>;

    /// Move a `building` job to `failed` and record the error log.
    ///
    /// Fails with [`crate::Error::Conflict`] if the job is not `building`.
    async fn mark_failed(&self, id: JobId, error_log: &str) -> Result<()>;

    /// Subscribe to changes of the queued view.
    ///
    /// Jobs already queued at subscription time are delivered first as
    /// [`ChangeKind::Added`].
    async fn subscribe(&self) -> Result<ChangeStream>;

    /// Release connections. Called once at shutdown.
    async fn close(&self);
}
