//! Stage templates of the Android release pipeline.

use forgeline_core::job::UNIVERSAL_PACKAGE_FILE_NAME;
use forgeline_core::pipeline::Stage;

use crate::variables::PACKAGE_FILE_NAME;

/// The fixed, ordered stages that turn a Capacitor project into a release
/// bundle and a universal APK.
///
/// Working directories are relative to the workspace root. The job's source
/// URL follows `--` so git never reads it as an option.
pub fn android_release_pipeline() -> Vec<Stage> {
    vec![
        Stage::run("clone", "", "git", ["clone", "--", "${job.source_url}", "."]),
        Stage::run("install", "", "npm", ["install"]),
        Stage::run(
            "sync",
            "",
            "npx",
            ["cap", "sync", "${toolchain.platform}"],
        ),
        Stage::run(
            "bundle",
            "${toolchain.platform}",
            "./gradlew",
            ["bundleRelease"],
        ),
        Stage::run(
            "convert",
            "",
            "java",
            [
                "-jar",
                "${toolchain.bundletool}",
                "build-apks",
                "--bundle=${paths.bundle}",
                "--output=${paths.package}",
                "--mode=universal",
            ],
        ),
        Stage::extract(
            "extract",
            PACKAGE_FILE_NAME,
            UNIVERSAL_PACKAGE_FILE_NAME,
            UNIVERSAL_PACKAGE_FILE_NAME,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_core::pipeline::StageAction;

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = android_release_pipeline()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(
            names,
            vec!["clone", "install", "sync", "bundle", "convert", "extract"]
        );
    }

    #[test]
    fn test_only_bundle_runs_in_platform_dir() {
        for stage in android_release_pipeline() {
            if let StageAction::Run { working_dir, .. } = &stage.action {
                if stage.name == "bundle" {
                    assert_eq!(working_dir, "${toolchain.platform}");
                } else {
                    assert!(working_dir.is_empty(), "stage {} not at root", stage.name);
                }
            }
        }
    }

    #[test]
    fn test_extract_reads_conversion_output() {
        let stages = android_release_pipeline();
        let last = stages.last().unwrap();
        match &last.action {
            StageAction::Extract {
                archive,
                entry,
                destination,
            } => {
                assert_eq!(archive, "output.apks");
                assert_eq!(entry, "universal.apk");
                assert_eq!(destination, "universal.apk");
            }
            other => panic!("Expected Extract, got {:?}", other),
        }
    }
}
