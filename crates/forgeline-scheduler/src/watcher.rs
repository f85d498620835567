//! Job watcher - turns queue change notifications into job processor tasks.

use crate::processor::{JobOutcome, JobProcessor};
use forgeline_core::queue::{ChangeKind, ChangeStream, JobChange};
use forgeline_core::{JobStatus, Result};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Counts of what happened to the jobs dispatched during one watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub panicked: usize,
}

impl WatchSummary {
    fn record(&mut self, finished: std::result::Result<JobOutcome, JoinError>) {
        match finished {
            Ok(JobOutcome::Succeeded(_)) => self.succeeded += 1,
            Ok(JobOutcome::Failed(_)) => self.failed += 1,
            Ok(JobOutcome::Skipped) => self.skipped += 1,
            Err(e) => {
                error!(error = %e, "Job task panicked");
                self.panicked += 1;
            }
        }
    }
}

/// Dispatches every newly queued job to its own processor task.
pub struct JobWatcher {
    processor: Arc<JobProcessor>,
    limit: Option<Arc<Semaphore>>,
}

impl JobWatcher {
    pub fn new(processor: Arc<JobProcessor>) -> Self {
        Self {
            processor,
            limit: None,
        }
    }

    /// Build at most `max` jobs at the same time. `None` is unbounded.
    pub fn with_max_concurrent_jobs(mut self, max: Option<usize>) -> Self {
        self.limit = max.map(|n| Arc::new(Semaphore::new(n)));
        self
    }

    /// Consume `changes` until the stream ends, fails, or `shutdown` resolves,
    /// then wait for every dispatched job to finish.
    ///
    /// A stream error is returned after the in-flight jobs are drained.
    pub async fn run<F>(&self, mut changes: ChangeStream, shutdown: F) -> Result<WatchSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut tasks = JoinSet::new();
        let mut summary = WatchSummary::default();
        let mut stream_error = None;

        info!("Watching for queued jobs");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting jobs");
                    break;
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    summary.record(finished);
                }
                change = changes.next() => match change {
                    Some(Ok(change)) => self.dispatch(change, &mut tasks, &mut summary),
                    Some(Err(e)) => {
                        error!(error = %e, "Job change stream failed");
                        stream_error = Some(e);
                        break;
                    }
                    None => {
                        info!("Job change stream ended");
                        break;
                    }
                },
            }
        }

        drop(changes);

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight jobs");
        }
        while let Some(finished) = tasks.join_next().await {
            summary.record(finished);
        }

        info!(
            dispatched = summary.dispatched,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Watcher stopped"
        );

        match stream_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn dispatch(
        &self,
        change: JobChange,
        tasks: &mut JoinSet<JobOutcome>,
        summary: &mut WatchSummary,
    ) {
        match change.kind {
            ChangeKind::Added => {}
            ChangeKind::Modified | ChangeKind::Removed => {
                debug!(job_id = %change.job_id, kind = ?change.kind, "Ignoring job change");
                return;
            }
        }

        if let Some(job) = &change.job {
            if job.status != JobStatus::Queued {
                debug!(job_id = %change.job_id, status = %job.status, "Added job is not queued");
                return;
            }
        }

        let processor = self.processor.clone();
        let limit = self.limit.clone();
        summary.dispatched += 1;

        tasks.spawn(async move {
            let _permit = match limit {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        warn!(error = %e, "Job limit unavailable, running unbounded");
                        None
                    }
                },
                None => None,
            };
            processor.process(change.job_id, change.job).await
        });
    }
}
