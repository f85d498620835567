//! Worker settings parsing.
//!
//! Every node in `forgeline.kdl` is optional:
//!
//! ```kdl
//! release host="https://github.com" path="YourUser/YourRepo/releases/download"
//! workspace root="builds"
//! toolchain platform="android" bundletool="bundletool.jar"
//! limits stage-timeout=1800 max-concurrent-jobs=4
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Settings of one worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub release: ReleaseConfig,
    pub workspace: WorkspaceConfig,
    pub toolchain: ToolchainConfig,
    pub limits: LimitsConfig,
}

/// Where published artifacts are downloaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Scheme and host of the release server, e.g. `https://github.com`.
    pub host: String,
    /// Path below the host under which `v<version>/` directories live.
    pub path: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            host: "https://github.com".to_string(),
            path: "YourUser/YourRepo/releases/download".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory under which per-job workspaces are created.
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("builds"),
        }
    }
}

/// Toolchain knobs referenced by the stage templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Native platform shell synchronized and compiled by the pipeline.
    pub platform: String,
    /// Path to the bundletool jar used for the universal package conversion.
    pub bundletool: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            platform: "android".to_string(),
            bundletool: "bundletool.jar".to_string(),
        }
    }
}

/// Optional bounds. `None` means unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Deadline applied to every external process.
    pub stage_timeout: Option<Duration>,
    /// Maximum number of jobs built at the same time.
    pub max_concurrent_jobs: Option<usize>,
}

impl WorkerConfig {
    /// Check values the parser cannot check on its own.
    pub fn validate(&self) -> ConfigResult<()> {
        let host = Url::parse(&self.release.host)
            .map_err(|e| ConfigError::invalid("release host", e.to_string()))?;
        if !matches!(host.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "release host",
                format!("unsupported scheme: {}", host.scheme()),
            ));
        }
        if host.host_str().is_none() {
            return Err(ConfigError::invalid("release host", "missing host"));
        }

        if self.workspace.root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("workspace root", "must not be empty"));
        }

        let mut components = Path::new(&self.toolchain.platform).components();
        let single_dir = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_dir || self.toolchain.platform.contains('/') {
            return Err(ConfigError::invalid(
                "toolchain platform",
                "must be a single directory name",
            ));
        }

        if self.toolchain.bundletool.is_empty() {
            return Err(ConfigError::invalid("toolchain bundletool", "must not be empty"));
        }

        Ok(())
    }
}

/// Read and parse a worker configuration file.
pub fn load_worker_config(path: &Path) -> ConfigResult<WorkerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_worker_config(&content)
}

/// Parse a worker configuration from KDL text.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = WorkerConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(format!("{} node", name)));
        }

        match name {
            "release" => {
                if let Some(host) = get_string_prop(node, "host") {
                    config.release.host = host;
                }
                if let Some(path) = get_string_prop(node, "path") {
                    config.release.path = path;
                }
            }
            "workspace" => {
                if let Some(root) = get_string_prop(node, "root") {
                    config.workspace.root = PathBuf::from(root);
                }
            }
            "toolchain" => {
                if let Some(platform) = get_string_prop(node, "platform") {
                    config.toolchain.platform = platform;
                }
                if let Some(bundletool) = get_string_prop(node, "bundletool") {
                    config.toolchain.bundletool = bundletool;
                }
            }
            "limits" => {
                config.limits.stage_timeout = get_positive_prop(node, "stage-timeout")?
                    .map(|secs| Duration::from_secs(secs as u64));
                config.limits.max_concurrent_jobs =
                    get_positive_prop(node, "max-concurrent-jobs")?.map(|n| n as usize);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_positive_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };

    let n = value
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(name, "expected an integer"))?;

    if n <= 0 || n > u32::MAX as i128 {
        return Err(ConfigError::invalid(name, format!("out of range: {}", n)));
    }

    Ok(Some(n as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_worker_config("").unwrap();

        assert_eq!(config.release.host, "https://github.com");
        assert_eq!(config.release.path, "YourUser/YourRepo/releases/download");
        assert_eq!(config.workspace.root, PathBuf::from("builds"));
        assert_eq!(config.toolchain.platform, "android");
        assert_eq!(config.toolchain.bundletool, "bundletool.jar");
        assert!(config.limits.stage_timeout.is_none());
        assert!(config.limits.max_concurrent_jobs.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            release host="https://dl.example.com" path="apps/releases"
            workspace root="/var/lib/forgeline/builds"
            toolchain platform="android" bundletool="/opt/bundletool/bundletool-all.jar"
            limits stage-timeout=1800 max-concurrent-jobs=4
        "#;

        let config = parse_worker_config(kdl).unwrap();
        assert_eq!(config.release.host, "https://dl.example.com");
        assert_eq!(config.release.path, "apps/releases");
        assert_eq!(
            config.workspace.root,
            PathBuf::from("/var/lib/forgeline/builds")
        );
        assert_eq!(
            config.toolchain.bundletool,
            "/opt/bundletool/bundletool-all.jar"
        );
        assert_eq!(config.limits.stage_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.limits.max_concurrent_jobs, Some(4));
    }

    #[test]
    fn test_partial_node_keeps_other_defaults() {
        let config = parse_worker_config(r#"release path="me/app/releases/download""#).unwrap();
        assert_eq!(config.release.host, "https://github.com");
        assert_eq!(config.release.path, "me/app/releases/download");
    }

    #[test]
    fn test_rejects_invalid_release_host() {
        let result = parse_worker_config(r#"release host="not a url""#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let result = parse_worker_config(r#"release host="ftp://files.example.com""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_non_positive_limits() {
        let result = parse_worker_config("limits stage-timeout=0");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let result = parse_worker_config("limits max-concurrent-jobs=-2");
        assert!(result.is_err());

        let result = parse_worker_config(r#"limits stage-timeout="soon""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_duplicate_nodes() {
        let kdl = r#"
            workspace root="a"
            workspace root="b"
        "#;
        assert!(matches!(
            parse_worker_config(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_rejects_nested_platform() {
        let result = parse_worker_config(r#"toolchain platform="../android""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_relative_platform_names() {
        for platform in [".", "..", "", "android/"] {
            let kdl = format!(r#"toolchain platform="{}""#, platform);
            assert!(parse_worker_config(&kdl).is_err(), "accepted {:?}", platform);
        }
        assert!(parse_worker_config(r#"toolchain platform="ios""#).is_ok());
    }

    #[test]
    fn test_syntax_error() {
        let result = parse_worker_config("release host=");
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forgeline.kdl");
        std::fs::write(&path, r#"workspace root="/tmp/forgeline""#).unwrap();

        let config = load_worker_config(&path).unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("/tmp/forgeline"));

        let missing = load_worker_config(&dir.path().join("missing.kdl"));
        assert!(matches!(missing.unwrap_err(), ConfigError::Io(_)));
    }
}
