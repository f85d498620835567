//! Variable interpolation for stage templates.
//!
//! Supports variables like:
//! - `${job.id}` - Job id
//! - `${job.project_id}` - Project id
//! - `${job.source_url}` - Repository cloned by the first stage
//! - `${job.version}` - Target version
//! - `${paths.workspace}` - Absolute workspace root
//! - `${paths.platform}` - Native platform directory inside the workspace
//! - `${paths.bundle}` - Compiled release bundle
//! - `${paths.package}` - Output of the universal package conversion
//! - `${toolchain.platform}` - Native platform name
//! - `${toolchain.bundletool}` - Absolute path to the bundletool jar
//! - `${env.VAR_NAME}` - Environment variable
//!
//! Interpolation happens per argument. A substituted value never splits into
//! several arguments, whatever characters it contains.

use forgeline_core::Job;
use forgeline_core::job::BUNDLE_FILE_NAME;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::ToolchainConfig;

/// File name of the conversion tool output inside the workspace.
pub const PACKAGE_FILE_NAME: &str = "output.apks";

/// Variable context containing all values available to stage templates.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub job: JobContext,
    pub paths: PathContext,
    pub toolchain: ToolchainContext,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub id: String,
    pub project_id: String,
    pub source_url: String,
    pub version: String,
}

/// Absolute paths inside one job's workspace.
#[derive(Debug, Clone, Default)]
pub struct PathContext {
    pub workspace: String,
    pub platform: String,
    pub bundle: String,
    pub package: String,
}

#[derive(Debug, Clone, Default)]
pub struct ToolchainContext {
    pub platform: String,
    pub bundletool: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Anchor a configured path at the worker's current directory. Stages run in
/// the job workspace, where a relative path would point somewhere else.
fn worker_relative(path: &str) -> String {
    std::path::absolute(path)
        .map(|path| path.display().to_string())
        .unwrap_or_else(|_| path.to_string())
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context for one job running in `workspace`.
    pub fn for_job(job: &Job, workspace: &Path, toolchain: &ToolchainConfig) -> Self {
        let platform_dir = workspace.join(&toolchain.platform);
        let bundle = platform_dir
            .join("app")
            .join("build")
            .join("outputs")
            .join("bundle")
            .join("release")
            .join(BUNDLE_FILE_NAME);

        Self {
            job: JobContext {
                id: job.id.to_string(),
                project_id: job.project_id.clone(),
                source_url: job.source_url.clone(),
                version: job.version.clone(),
            },
            paths: PathContext {
                workspace: workspace.display().to_string(),
                platform: platform_dir.display().to_string(),
                bundle: bundle.display().to_string(),
                package: workspace.join(PACKAGE_FILE_NAME).display().to_string(),
            },
            toolchain: ToolchainContext {
                platform: toolchain.platform.clone(),
                bundletool: worker_relative(&toolchain.bundletool),
            },
            env: HashMap::new(),
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["job", "id"] => Some(self.job.id.clone()),
            ["job", "project_id"] => Some(self.job.project_id.clone()),
            ["job", "source_url"] => Some(self.job.source_url.clone()),
            ["job", "version"] => Some(self.job.version.clone()),

            ["paths", "workspace"] => Some(self.paths.workspace.clone()),
            ["paths", "platform"] => Some(self.paths.platform.clone()),
            ["paths", "bundle"] => Some(self.paths.bundle.clone()),
            ["paths", "package"] => Some(self.paths.package.clone()),

            ["toolchain", "platform"] => Some(self.toolchain.platform.clone()),
            ["toolchain", "bundletool"] => Some(self.toolchain.bundletool.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of arguments.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }
}
