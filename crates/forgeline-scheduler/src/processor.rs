//! Job processor - owns the lifecycle of one job from claim to cleanup.

use crate::pipeline::{BuildPipeline, PipelineReport};
use crate::workspace::WorkspaceRoot;
use forgeline_config::{ReleaseConfig, WorkerConfig, android_release_pipeline};
use forgeline_core::artifact::ArchiveExtractor;
use forgeline_core::executor::ProcessRunner;
use forgeline_core::pipeline::{FailureKind, StageFailure};
use forgeline_core::queue::{ClaimOutcome, JobQueue};
use forgeline_core::{ArtifactUrls, Job, JobId};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How processing a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job was not claimed by this processor.
    Skipped,
    /// The job was built and reported as `success`.
    Succeeded(ArtifactUrls),
    /// The job was reported as `failed` with this error log.
    Failed(String),
}

/// Claims a job, builds it in a fresh workspace and writes the final status.
pub struct JobProcessor {
    queue: Arc<dyn JobQueue>,
    pipeline: BuildPipeline,
    workspaces: WorkspaceRoot,
    release: ReleaseConfig,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: BuildPipeline,
        workspaces: WorkspaceRoot,
        release: ReleaseConfig,
    ) -> Self {
        Self {
            queue,
            pipeline,
            workspaces,
            release,
        }
    }

    /// Processor running the Android release pipeline with worker settings.
    pub fn from_config(
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn ProcessRunner>,
        extractor: Arc<dyn ArchiveExtractor>,
        config: &WorkerConfig,
    ) -> Self {
        let pipeline = BuildPipeline::new(
            runner,
            extractor,
            android_release_pipeline(),
            config.toolchain.clone(),
        )
        .with_stage_timeout(config.limits.stage_timeout);

        Self::new(
            queue,
            pipeline,
            WorkspaceRoot::new(&config.workspace.root),
            config.release.clone(),
        )
    }

    /// Process one job. `snapshot` is the job as seen in the notification.
    ///
    /// Never fails: every problem after a successful claim ends up in the
    /// job's error log, and the workspace is removed on every path.
    pub async fn process(&self, job_id: JobId, snapshot: Option<Job>) -> JobOutcome {
        let span = info_span!("job", job_id = %job_id);
        self.process_inner(job_id, snapshot).instrument(span).await
    }

    async fn process_inner(&self, job_id: JobId, snapshot: Option<Job>) -> JobOutcome {
        if let Some(job) = &snapshot {
            debug!(version = %job.version, "Received job");
        }

        let job = match self.queue.claim(job_id).await {
            Ok(ClaimOutcome::Claimed(job)) => job,
            Ok(ClaimOutcome::NotFound) => {
                debug!("Job no longer exists, skipping");
                return JobOutcome::Skipped;
            }
            Ok(ClaimOutcome::NotQueued(status)) => {
                debug!(%status, "Job already taken, skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                warn!(error = %e, "Failed to claim job");
                return JobOutcome::Skipped;
            }
        };

        info!(
            project_id = %job.project_id,
            source_url = %job.source_url,
            version = %job.version,
            "Claimed job, starting build"
        );

        let result = self.execute(&job).await;
        let outcome = self.report(&job, result).await;

        if let Err(e) = self.workspaces.remove(job.id).await {
            error!(error = %e, "Failed to clean up workspace");
        }

        outcome
    }

    /// Prepare the workspace and run the pipeline. Returns the error log on
    /// failure.
    async fn execute(&self, job: &Job) -> Result<PipelineReport, String> {
        let workspace = match self.workspaces.prepare(job.id).await {
            Ok(path) => path,
            Err(e) => {
                let failure = StageFailure::new("prepare", FailureKind::Workspace, e.to_string());
                return Err(failure.error_log());
            }
        };

        let run = AssertUnwindSafe(self.pipeline.run(job, &workspace)).catch_unwind();
        match run.await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(failure)) => Err(failure.error_log()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(message = %message, "Pipeline panicked");
                Err(format!("pipeline panicked: {}", message))
            }
        }
    }

    async fn report(&self, job: &Job, result: Result<PipelineReport, String>) -> JobOutcome {
        let report = match result {
            Ok(report) => report,
            Err(error_log) => return self.fail(job.id, error_log).await,
        };

        let urls = ArtifactUrls::for_release(&self.release.host, &self.release.path, &job.version);
        match self.queue.mark_succeeded(job.id, &urls).await {
            Ok(()) => {
                info!(
                    stages = report.stages.len(),
                    aab_url = %urls.aab_url,
                    apk_url = %urls.apk_url,
                    "Build succeeded"
                );
                JobOutcome::Succeeded(urls)
            }
            Err(e) => {
                error!(error = %e, "Failed to report success");
                self.fail(job.id, format!("failed to report success: {}", e))
                    .await
            }
        }
    }

    async fn fail(&self, job_id: JobId, error_log: String) -> JobOutcome {
        info!(error_log = %error_log, "Build failed");
        if let Err(e) = self.queue.mark_failed(job_id, &error_log).await {
            error!(error = %e, "Failed to report failure");
        }
        JobOutcome::Failed(error_log)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
