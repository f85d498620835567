//! Job lifecycle engine for the Forgeline build worker.
//!
//! Watches the queue for new jobs, claims them, runs the build pipeline in a
//! per-job workspace and reports the outcome. Claiming is a conditional
//! update, so any number of workers can watch the same queue.

pub mod pipeline;
pub mod processor;
pub mod watcher;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use pipeline::{BuildPipeline, PipelineEvent, PipelineReport, StageReport};
pub use processor::{JobOutcome, JobProcessor};
pub use watcher::{JobWatcher, WatchSummary};
pub use workspace::WorkspaceRoot;
