//! Fakes shared by the scheduler tests.

use async_trait::async_trait;
use forgeline_core::artifact::{ArchiveExtractor, ExtractError, ExtractedArtifact};
use forgeline_core::executor::{ProcessOutcome, ProcessRunner, ProcessSpec};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Script {
    Fail,
    Unstartable,
    TimeOut,
    Panic,
}

/// Process runner that never spawns anything.
///
/// Every command succeeds unless scripted otherwise, except that cloning a
/// URL containing `bad.repo` fails the way git does for a missing repository.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, Script>,
    delay: Option<Duration>,
    package_entries: Option<Vec<String>>,
    specs: Mutex<Vec<ProcessSpec>>,
    dirs_existed: Mutex<Vec<bool>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_program(mut self, program: &str) -> Self {
        self.scripts.insert(program.to_string(), Script::Fail);
        self
    }

    pub fn unstartable_program(mut self, program: &str) -> Self {
        self.scripts.insert(program.to_string(), Script::Unstartable);
        self
    }

    pub fn timeout_program(mut self, program: &str) -> Self {
        self.scripts.insert(program.to_string(), Script::TimeOut);
        self
    }

    pub fn panic_program(mut self, program: &str) -> Self {
        self.scripts.insert(program.to_string(), Script::Panic);
        self
    }

    /// Sleep this long inside every command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make `java` write a real zip with these entries to its `--output=` path.
    pub fn writing_package(mut self, entries: &[&str]) -> Self {
        self.package_entries = Some(entries.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.specs().into_iter().map(|s| s.program).collect()
    }

    /// Whether the working directory existed for each command, in order.
    pub fn dirs_existed(&self) -> Vec<bool> {
        self.dirs_existed.lock().unwrap().clone()
    }

    /// Highest number of commands that ran at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn write_package(&self, spec: &ProcessSpec) {
        let Some(entries) = &self.package_entries else {
            return;
        };
        let Some(output) = spec.args.iter().find_map(|a| a.strip_prefix("--output=")) else {
            return;
        };

        let mut writer = zip::ZipWriter::new(std::fs::File::create(output).unwrap());
        for entry in entries {
            writer
                .start_file(entry.clone(), zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"package bytes").unwrap();
        }
        writer.finish().unwrap();
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, spec: ProcessSpec) -> ProcessOutcome {
        self.specs.lock().unwrap().push(spec.clone());
        self.dirs_existed
            .lock()
            .unwrap()
            .push(spec.working_dir.is_dir());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if spec.program == "git" && spec.args.iter().any(|a| a.contains("bad.repo")) {
            return ProcessOutcome::Failed {
                exit_code: Some(128),
                spawned: true,
                output: "Cloning into '.'...\nfatal: repository 'https://bad.repo/' not found\n"
                    .to_string(),
            };
        }

        match self.scripts.get(&spec.program) {
            Some(Script::Fail) => ProcessOutcome::Failed {
                exit_code: Some(1),
                spawned: true,
                output: format!("{} failed\n", spec.program),
            },
            Some(Script::Unstartable) => ProcessOutcome::Failed {
                exit_code: None,
                spawned: false,
                output: format!("failed to start {}: No such file or directory", spec.program),
            },
            Some(Script::TimeOut) => ProcessOutcome::TimedOut {
                after: spec.timeout.unwrap_or_default(),
                output: String::new(),
            },
            Some(Script::Panic) => panic!("{} blew up", spec.program),
            None => {
                if spec.program == "java" {
                    self.write_package(&spec);
                }
                ProcessOutcome::Succeeded {
                    output: String::new(),
                }
            }
        }
    }
}

/// Extractor that pretends the entry is, or is not, in the archive.
pub struct FakeExtractor {
    has_entry: bool,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn with_entry() -> Self {
        Self {
            has_entry: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn without_entry() -> Self {
        Self {
            has_entry: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveExtractor for FakeExtractor {
    async fn extract(
        &self,
        archive: &Path,
        entry: &str,
        destination: &Path,
    ) -> Result<ExtractedArtifact, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.has_entry {
            return Err(ExtractError::EntryNotFound {
                archive: archive.to_path_buf(),
                entry: entry.to_string(),
            });
        }
        Ok(ExtractedArtifact {
            entry: entry.to_string(),
            path: PathBuf::from(destination),
            checksum: String::new(),
            size: 0,
        })
    }
}
