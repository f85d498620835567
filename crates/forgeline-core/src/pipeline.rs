//! Pipeline stage definitions and stage failures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage in the build pipeline.
///
/// String fields are templates; `${...}` variables are resolved against the
/// job and its workspace right before the stage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (e.g. "clone", "bundle").
    pub name: String,
    /// What this stage does.
    pub action: StageAction,
}

/// What a stage does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageAction {
    /// Run an external command.
    Run {
        program: String,
        args: Vec<String>,
        /// Working directory relative to the workspace root; empty for the root.
        working_dir: String,
    },
    /// Extract one entry out of an archive produced by an earlier stage.
    Extract {
        /// Archive path relative to the workspace root.
        archive: String,
        /// Exact entry name.
        entry: String,
        /// Destination relative to the workspace root.
        destination: String,
    },
}

impl Stage {
    pub fn run<I, S>(name: &str, working_dir: &str, program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            action: StageAction::Run {
                program: program.to_string(),
                args: args.into_iter().map(Into::into).collect(),
                working_dir: working_dir.to_string(),
            },
        }
    }

    pub fn extract(name: &str, archive: &str, entry: &str, destination: &str) -> Self {
        Self {
            name: name.to_string(),
            action: StageAction::Extract {
                archive: archive.to_string(),
                entry: entry.to_string(),
                destination: destination.to_string(),
            },
        }
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The process ran and exited non-zero (`None` when killed by a signal).
    ExitStatus { code: Option<i32> },
    /// The process could not be started.
    SpawnFailed,
    /// The stage deadline elapsed.
    TimedOut,
    /// The expected entry was absent from the archive.
    ArtifactNotFound,
    /// The archive could not be read or the entry could not be written.
    Extraction,
    /// The workspace could not be prepared for the pipeline.
    Workspace,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ExitStatus { code: Some(code) } => write!(f, "exit code {}", code),
            FailureKind::ExitStatus { code: None } => f.write_str("terminated by signal"),
            FailureKind::SpawnFailed => f.write_str("could not start"),
            FailureKind::TimedOut => f.write_str("timed out"),
            FailureKind::ArtifactNotFound => f.write_str("artifact not found"),
            FailureKind::Extraction => f.write_str("extraction failed"),
            FailureKind::Workspace => f.write_str("workspace error"),
        }
    }
}

/// The first failing stage of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub kind: FailureKind,
    /// Diagnostic output of the failing stage only.
    pub diagnostic: String,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, kind: FailureKind, diagnostic: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind,
            diagnostic: diagnostic.into(),
        }
    }

    /// Text persisted as the job's error log.
    pub fn error_log(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.kind)?;
        let diagnostic = self.diagnostic.trim_end();
        if !diagnostic.is_empty() {
            write!(f, "\n{}", diagnostic)?;
        }
        Ok(())
    }
}

impl std::error::Error for StageFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_names_stage_and_kind() {
        let failure = StageFailure::new(
            "clone",
            FailureKind::ExitStatus { code: Some(128) },
            "fatal: unable to access 'https://nonexistent.invalid/'\n",
        );

        assert_eq!(
            failure.error_log(),
            "stage 'clone' failed: exit code 128\nfatal: unable to access 'https://nonexistent.invalid/'"
        );
    }

    #[test]
    fn test_error_log_without_diagnostic() {
        let failure = StageFailure::new("bundle", FailureKind::TimedOut, "  \n");
        assert_eq!(failure.error_log(), "stage 'bundle' failed: timed out");
    }

    #[test]
    fn test_stage_constructors() {
        let stage = Stage::run("install", "", "npm", ["install"]);
        match stage.action {
            StageAction::Run {
                program,
                args,
                working_dir,
            } => {
                assert_eq!(program, "npm");
                assert_eq!(args, vec!["install"]);
                assert!(working_dir.is_empty());
            }
            other => panic!("Expected Run, got {:?}", other),
        }

        let stage = Stage::extract("extract", "output.apks", "universal.apk", "universal.apk");
        assert!(matches!(stage.action, StageAction::Extract { .. }));
    }
}
