//! Process runner trait and its input/output types.
//!
//! Pipeline stages that shell out to a toolchain (git, npm, gradle, java)
//! go through a [`ProcessRunner`], so tests can substitute a fake that never
//! spawns anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Specification of one external command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Program to execute, resolved through `PATH` unless it contains a slash.
    pub program: String,
    /// Arguments passed as discrete argv elements. Never joined into a shell line.
    pub args: Vec<String>,
    /// Working directory. Must already exist.
    pub working_dir: PathBuf,
    /// Extra environment variables on top of the worker's own environment.
    pub env: HashMap<String, String>,
    /// Deadline for the whole invocation.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line as it would be typed, for log messages only.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How an external command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    /// Exit code 0.
    Succeeded { output: String },
    /// Non-zero exit, killed by a signal (`exit_code: None`), or never started.
    Failed {
        exit_code: Option<i32>,
        spawned: bool,
        output: String,
    },
    /// The deadline elapsed and the process was killed.
    TimedOut { after: Duration, output: String },
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Succeeded { .. })
    }

    /// Captured stdout/stderr, or the spawn error for processes that never started.
    pub fn output(&self) -> &str {
        match self {
            ProcessOutcome::Succeeded { output }
            | ProcessOutcome::Failed { output, .. }
            | ProcessOutcome::TimedOut { output, .. } => output,
        }
    }
}

/// A line of output from a running process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Trait for external process runners.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Run the command to completion.
    ///
    /// Never returns an error: failing to start is reported as
    /// [`ProcessOutcome::Failed`] with `spawned: false`.
    async fn run(&self, spec: ProcessSpec) -> ProcessOutcome;
}
