//! Build pipeline sequencer - runs the stages of one job in order.

use forgeline_config::{ToolchainConfig, VariableContext};
use forgeline_core::artifact::{ArchiveExtractor, ExtractError, ExtractedArtifact};
use forgeline_core::executor::{ProcessOutcome, ProcessRunner, ProcessSpec};
use forgeline_core::pipeline::{FailureKind, Stage, StageAction, StageFailure};
use forgeline_core::{Job, JobId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { job_id: JobId, stage: String },
    StageCompleted { job_id: JobId, stage: String, success: bool },
    PipelineCompleted { job_id: JobId, success: bool },
}

/// A stage that completed successfully.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed: Duration,
}

/// Result of a pipeline run in which every stage passed.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    /// Files written by extraction stages.
    pub artifacts: Vec<ExtractedArtifact>,
}

/// Runs a fixed list of stages, stopping at the first failure.
pub struct BuildPipeline {
    runner: Arc<dyn ProcessRunner>,
    extractor: Arc<dyn ArchiveExtractor>,
    stages: Vec<Stage>,
    toolchain: ToolchainConfig,
    stage_timeout: Option<Duration>,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl BuildPipeline {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        extractor: Arc<dyn ArchiveExtractor>,
        stages: Vec<Stage>,
        toolchain: ToolchainConfig,
    ) -> Self {
        Self {
            runner,
            extractor,
            stages,
            toolchain,
            stage_timeout: None,
            events: None,
        }
    }

    /// Deadline applied to every external process.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Send stage progress to `events`. Events are dropped if the receiver
    /// is gone.
    pub fn with_events(mut self, events: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run every stage for `job` inside `workspace`.
    pub async fn run(&self, job: &Job, workspace: &Path) -> Result<PipelineReport, StageFailure> {
        let mut vars = VariableContext::for_job(job, workspace, &self.toolchain);
        vars.populate_env();

        let mut report = PipelineReport::default();

        for stage in &self.stages {
            self.emit(PipelineEvent::StageStarted {
                job_id: job.id,
                stage: stage.name.clone(),
            })
            .await;
            info!(stage = %stage.name, "Stage started");

            let started = Instant::now();
            let result = self.run_stage(stage, workspace, &vars).await;
            let success = result.is_ok();

            self.emit(PipelineEvent::StageCompleted {
                job_id: job.id,
                stage: stage.name.clone(),
                success,
            })
            .await;

            match result {
                Ok(artifact) => {
                    let elapsed = started.elapsed();
                    info!(stage = %stage.name, ?elapsed, "Stage completed successfully");
                    report.stages.push(StageReport {
                        name: stage.name.clone(),
                        elapsed,
                    });
                    report.artifacts.extend(artifact);
                }
                Err(failure) => {
                    error!(stage = %stage.name, kind = %failure.kind, "Stage failed");
                    self.emit(PipelineEvent::PipelineCompleted {
                        job_id: job.id,
                        success: false,
                    })
                    .await;
                    return Err(failure);
                }
            }
        }

        self.emit(PipelineEvent::PipelineCompleted {
            job_id: job.id,
            success: true,
        })
        .await;
        Ok(report)
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        workspace: &Path,
        vars: &VariableContext,
    ) -> Result<Option<ExtractedArtifact>, StageFailure> {
        match &stage.action {
            StageAction::Run {
                program,
                args,
                working_dir,
            } => {
                let spec = ProcessSpec::new(
                    vars.interpolate(program),
                    stage_dir(workspace, &vars.interpolate(working_dir)),
                )
                .args(vars.interpolate_vec(args))
                .timeout(self.stage_timeout);

                match self.runner.run(spec).await {
                    ProcessOutcome::Succeeded { .. } => Ok(None),
                    ProcessOutcome::Failed {
                        exit_code,
                        spawned,
                        output,
                    } => {
                        let kind = if spawned {
                            FailureKind::ExitStatus { code: exit_code }
                        } else {
                            FailureKind::SpawnFailed
                        };
                        Err(StageFailure::new(&stage.name, kind, output))
                    }
                    ProcessOutcome::TimedOut { output, .. } => {
                        Err(StageFailure::new(&stage.name, FailureKind::TimedOut, output))
                    }
                }
            }
            StageAction::Extract {
                archive,
                entry,
                destination,
            } => {
                let archive = workspace.join(vars.interpolate(archive));
                let destination = workspace.join(vars.interpolate(destination));
                let entry = vars.interpolate(entry);

                match self.extractor.extract(&archive, &entry, &destination).await {
                    Ok(artifact) => Ok(Some(artifact)),
                    Err(e @ ExtractError::EntryNotFound { .. }) => Err(StageFailure::new(
                        &stage.name,
                        FailureKind::ArtifactNotFound,
                        e.to_string(),
                    )),
                    Err(e) => Err(StageFailure::new(
                        &stage.name,
                        FailureKind::Extraction,
                        e.to_string(),
                    )),
                }
            }
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

fn stage_dir(workspace: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        workspace.to_path_buf()
    } else {
        workspace.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExtractor, ScriptedRunner};
    use forgeline_config::android_release_pipeline;

    fn job(source_url: &str) -> Job {
        Job::queued(JobId::generate(), "proj", source_url, "1.2.3")
    }

    fn pipeline(runner: Arc<ScriptedRunner>, extractor: Arc<FakeExtractor>) -> BuildPipeline {
        BuildPipeline::new(
            runner,
            extractor,
            android_release_pipeline(),
            ToolchainConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_all_stages_run_in_order() {
        let runner = Arc::new(ScriptedRunner::new());
        let extractor = Arc::new(FakeExtractor::with_entry());
        let ws = Path::new("/ws/job");

        let report = pipeline(runner.clone(), extractor.clone())
            .run(&job("https://good.repo"), ws)
            .await
            .unwrap();

        let names: Vec<_> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["clone", "install", "sync", "bundle", "convert", "extract"]
        );
        assert_eq!(runner.programs(), vec!["git", "npm", "npx", "./gradlew", "java"]);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].path, ws.join("universal.apk"));
    }

    #[tokio::test]
    async fn test_commands_are_resolved_per_argument() {
        let runner = Arc::new(ScriptedRunner::new());
        let extractor = Arc::new(FakeExtractor::with_entry());
        let ws = Path::new("/ws/job");

        pipeline(runner.clone(), extractor)
            .run(&job("https://good.repo"), ws)
            .await
            .unwrap();

        let specs = runner.specs();
        assert_eq!(specs[0].args, vec!["clone", "--", "https://good.repo", "."]);
        assert_eq!(specs[0].working_dir, ws);
        assert_eq!(specs[2].args, vec!["cap", "sync", "android"]);
        assert_eq!(specs[3].working_dir, ws.join("android"));

        let bundle = ws.join("android/app/build/outputs/bundle/release/app-release.aab");
        let jar = std::env::current_dir().unwrap().join("bundletool.jar");
        assert_eq!(
            specs[4].args,
            vec![
                "-jar".to_string(),
                jar.display().to_string(),
                "build-apks".to_string(),
                format!("--bundle={}", bundle.display()),
                format!("--output={}", ws.join("output.apks").display()),
                "--mode=universal".to_string(),
            ]
        );
        assert_eq!(specs[4].working_dir, ws);
    }

    #[tokio::test]
    async fn test_clone_failure_stops_pipeline() {
        let runner = Arc::new(ScriptedRunner::new());
        let extractor = Arc::new(FakeExtractor::with_entry());

        let failure = pipeline(runner.clone(), extractor.clone())
            .run(&job("https://bad.repo"), Path::new("/ws/job"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, "clone");
        assert_eq!(failure.kind, FailureKind::ExitStatus { code: Some(128) });
        assert!(failure.diagnostic.contains("repository 'https://bad.repo/' not found"));
        assert_eq!(runner.programs(), vec!["git"]);
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_conversion_skips_extraction() {
        let runner = Arc::new(ScriptedRunner::new().fail_program("java"));
        let extractor = Arc::new(FakeExtractor::with_entry());

        let failure = pipeline(runner.clone(), extractor.clone())
            .run(&job("https://good.repo"), Path::new("/ws/job"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, "convert");
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_entry_is_artifact_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        let extractor = Arc::new(FakeExtractor::without_entry());

        let failure = pipeline(runner, extractor)
            .run(&job("https://good.repo"), Path::new("/ws/job"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, "extract");
        assert_eq!(failure.kind, FailureKind::ArtifactNotFound);
        assert_eq!(
            failure.diagnostic,
            format!("universal.apk not found in {}", Path::new("/ws/job/output.apks").display())
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_and_timeout_kinds() {
        let extractor = Arc::new(FakeExtractor::with_entry());

        let runner = Arc::new(ScriptedRunner::new().unstartable_program("npm"));
        let failure = pipeline(runner, extractor.clone())
            .run(&job("https://good.repo"), Path::new("/ws/job"))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, "install");
        assert_eq!(failure.kind, FailureKind::SpawnFailed);

        let runner = Arc::new(ScriptedRunner::new().timeout_program("./gradlew"));
        let failure = pipeline(runner, extractor)
            .run(&job("https://good.repo"), Path::new("/ws/job"))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, "bundle");
        assert_eq!(failure.kind, FailureKind::TimedOut);
    }

    #[tokio::test]
    async fn test_stage_timeout_is_passed_to_runner() {
        let runner = Arc::new(ScriptedRunner::new());
        let extractor = Arc::new(FakeExtractor::with_entry());

        pipeline(runner.clone(), extractor)
            .with_stage_timeout(Some(Duration::from_secs(30)))
            .run(&job("https://good.repo"), Path::new("/ws/job"))
            .await
            .unwrap();

        assert!(
            runner
                .specs()
                .iter()
                .all(|s| s.timeout == Some(Duration::from_secs(30)))
        );
    }

    #[tokio::test]
    async fn test_events_report_progress() {
        let runner = Arc::new(ScriptedRunner::new().fail_program("npx"));
        let extractor = Arc::new(FakeExtractor::with_entry());
        let (tx, mut rx) = mpsc::channel(64);
        let job = job("https://good.repo");

        let pipeline = pipeline(runner, extractor).with_events(tx);
        pipeline.run(&job, Path::new("/ws/job")).await.unwrap_err();
        drop(pipeline);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let completed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageCompleted { stage, success, .. } => {
                    Some((stage.as_str(), *success))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            completed,
            vec![("clone", true), ("install", true), ("sync", false)]
        );
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: false, job_id }) if *job_id == job.id
        ));
    }
}
