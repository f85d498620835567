//! Configuration for the Forgeline build worker.
//!
//! This crate handles:
//! - Worker settings (forgeline.kdl)
//! - The Android release pipeline stage templates
//! - Variable interpolation for stage arguments

pub mod error;
pub mod pipeline;
pub mod variables;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::android_release_pipeline;
pub use variables::{JobContext, PathContext, ToolchainContext, VariableContext};
pub use worker::{
    LimitsConfig, ReleaseConfig, ToolchainConfig, WorkerConfig, WorkspaceConfig,
    load_worker_config, parse_worker_config,
};
