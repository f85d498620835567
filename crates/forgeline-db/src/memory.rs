//! In-memory job queue.
//!
//! Same transition rules as the PostgreSQL queue, kept in a single map behind
//! a mutex. Every status write is recorded so callers can inspect the exact
//! sequence a job went through.

use async_trait::async_trait;
use chrono::Utc;
use forgeline_core::queue::{ChangeKind, ChangeStream, ClaimOutcome, JobChange, JobQueue};
use forgeline_core::{ArtifactUrls, Error, Job, JobId, JobStatus, Result};
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

const CHANGE_BUFFER: usize = 256;

struct State {
    jobs: HashMap<JobId, Job>,
    transitions: HashMap<JobId, Vec<JobStatus>>,
    changes: Option<broadcast::Sender<JobChange>>,
}

impl State {
    fn publish(&self, change: JobChange) {
        if let Some(tx) = &self.changes {
            // No subscribers is fine.
            let _ = tx.send(change);
        }
    }

    /// Queued jobs, oldest first.
    fn queued(&self) -> Vec<Job> {
        let mut queued: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|job| job.updated_at);
        queued
    }

    fn record(&mut self, id: JobId, status: JobStatus) {
        self.transitions.entry(id).or_default().push(status);
    }

    /// Apply `building -> next`, or explain why it is not allowed.
    fn finish(&mut self, id: JobId, next: JobStatus) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        if !job.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "job {} is {}, cannot move to {}",
                id, job.status, next
            )));
        }
        job.status = next;
        job.updated_at = Utc::now();
        Ok(job)
    }
}

/// Job queue held entirely in process memory.
pub struct MemoryJobQueue {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_change_buffer(CHANGE_BUFFER)
    }

    /// Queue whose subscribers can fall at most `capacity` changes behind
    /// before they are resynchronised from the queued snapshot.
    pub fn with_change_buffer(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(State {
                jobs: HashMap::new(),
                transitions: HashMap::new(),
                changes: Some(tx),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Create and insert a new queued job.
    pub fn enqueue(&self, project_id: &str, source_url: &str, version: &str) -> Job {
        let job = Job::queued(JobId::generate(), project_id, source_url, version);
        self.insert(job.clone());
        job
    }

    /// Insert a job as-is, replacing any job with the same id.
    ///
    /// A queued job is announced to subscribers as added.
    pub fn insert(&self, job: Job) {
        let mut state = self.state();
        state.record(job.id, job.status);
        if job.status == JobStatus::Queued {
            state.publish(JobChange::added(job.clone()));
        }
        state.jobs.insert(job.id, job);
    }

    /// Every status a job has been written with, in order.
    pub fn transitions(&self, id: JobId) -> Vec<JobStatus> {
        self.state()
            .transitions
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Current copy of a job.
    pub fn snapshot(&self, id: JobId) -> Option<Job> {
        self.state().jobs.get(&id).cloned()
    }

}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.snapshot(id))
    }

    async fn claim(&self, id: JobId) -> Result<ClaimOutcome> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if job.status != JobStatus::Queued {
            return Ok(ClaimOutcome::NotQueued(job.status));
        }

        job.status = JobStatus::Building;
        job.updated_at = Utc::now();
        let claimed = job.clone();

        state.record(id, JobStatus::Building);
        state.publish(JobChange {
            kind: ChangeKind::Removed,
            job_id: id,
            job: None,
        });
        debug!(job_id = %id, "Claimed job");
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn mark_succeeded(&self, id: JobId, artifacts: &ArtifactUrls) -> Result<()> {
        let mut state = self.state();
        let job = state.finish(id, JobStatus::Success)?;
        job.artifacts = Some(artifacts.clone());
        state.record(id, JobStatus::Success);
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error_log: &str) -> Result<()> {
        let mut state = self.state();
        let job = state.finish(id, JobStatus::Failed)?;
        job.error_log = Some(error_log.to_string());
        state.record(id, JobStatus::Failed);
        Ok(())
    }

    async fn subscribe(&self) -> Result<ChangeStream> {
        // Snapshot and receiver are taken under one lock, so every later
        // change reaches the receiver and none is lost in between.
        let state = self.state();
        let tx = state
            .changes
            .as_ref()
            .ok_or_else(|| Error::Subscription("queue is closed".to_string()))?;
        let rx = tx.subscribe();

        let queued = state.queued();
        drop(state);

        let initial = stream::iter(queued.into_iter().map(|job| Ok(JobChange::added(job))));
        // A lagging subscriber missed some changes; re-announcing every queued
        // job covers them, and claiming absorbs the duplicates.
        let shared = self.state.clone();
        let live = BroadcastStream::new(rx).flat_map(move |change| {
            let changes = match change {
                Ok(change) => vec![Ok(change)],
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Job subscriber lagged, re-reading queued jobs");
                    lock(&shared)
                        .queued()
                        .into_iter()
                        .map(|job| Ok(JobChange::added(job)))
                        .collect()
                }
            };
            stream::iter(changes)
        });

        Ok(initial.chain(live).boxed())
    }

    async fn close(&self) {
        self.state().changes = None;
    }
}
