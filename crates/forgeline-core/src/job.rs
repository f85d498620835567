//! Build job records and the status transition graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, JobId};

/// File name of the release bundle artifact.
pub const BUNDLE_FILE_NAME: &str = "app-release.aab";

/// File name of the universal installable package.
pub const UNIVERSAL_PACKAGE_FILE_NAME: &str = "universal.apk";

/// Status of a build job.
///
/// Transitions are one-way: `queued -> building -> {success | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Building,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Building => "building",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Whether `next` is the immediate successor of this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Building)
                | (JobStatus::Building, JobStatus::Success)
                | (JobStatus::Building, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "building" => Ok(JobStatus::Building),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// Download locations of the artifacts produced by a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUrls {
    pub aab_url: String,
    pub apk_url: String,
}

impl ArtifactUrls {
    /// Build the artifact URLs for `version`.
    ///
    /// The layout is `<host>/<releases_path>/v<version>/<file>`. Redundant
    /// slashes at the joins are dropped.
    pub fn for_release(host: &str, releases_path: &str, version: &str) -> Self {
        let host = host.trim_end_matches('/');
        let path = releases_path.trim_matches('/');
        let base = if path.is_empty() {
            format!("{}/v{}", host, version)
        } else {
            format!("{}/{}/v{}", host, path, version)
        };

        Self {
            aab_url: format!("{}/{}", base, BUNDLE_FILE_NAME),
            apk_url: format!("{}/{}", base, UNIVERSAL_PACKAGE_FILE_NAME),
        }
    }
}

/// A build request tracked by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: String,
    /// Repository cloned by the first pipeline stage.
    pub source_url: String,
    /// Version string used for the release URLs.
    pub version: String,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
    /// Set only when the job failed.
    pub error_log: Option<String>,
    /// Set only when the job succeeded.
    pub artifacts: Option<ArtifactUrls>,
}

impl Job {
    /// A freshly queued job.
    pub fn queued(
        id: JobId,
        project_id: impl Into<String>,
        source_url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id,
            project_id: project_id.into(),
            source_url: source_url.into(),
            version: version.into(),
            status: JobStatus::Queued,
            updated_at: Utc::now(),
            error_log: None,
            artifacts: None,
        }
    }
}
