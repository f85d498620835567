//! Local process runner.

use async_trait::async_trait;
use chrono::Utc;
use forgeline_core::executor::*;
use futures::future::join_all;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Amount of output kept for the error log (64KB). Older output is dropped.
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// How long to keep reading output after the process exited. Background
/// children (e.g. a build daemon) may hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(5);

/// Runs commands as child processes of the worker.
///
/// Output is streamed line by line to the `forgeline::process` tracing target
/// while the command runs, and the tail of it is kept for diagnostics.
#[derive(Debug, Clone)]
pub struct LocalProcessRunner {
    max_output: usize,
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self {
            max_output: MAX_OUTPUT_SIZE,
        }
    }

    /// Override how many bytes of output are kept.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output.max(1);
        self
    }
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, spec: ProcessSpec) -> ProcessOutcome {
        let command_line = spec.display_command();

        if !spec.working_dir.is_dir() {
            return ProcessOutcome::Failed {
                exit_code: None,
                spawned: false,
                output: format!(
                    "working directory {} does not exist",
                    spec.working_dir.display()
                ),
            };
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches build daemons and
        // other descendants.
        #[cfg(unix)]
        command.process_group(0);

        info!(command = %command_line, dir = %spec.working_dir.display(), "Starting process");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %command_line, error = %e, "Failed to start process");
                return ProcessOutcome::Failed {
                    exit_code: None,
                    spawned: false,
                    output: format!("failed to start {}: {}", spec.program, e),
                };
            }
        };

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.max_output)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, LogStream::Stdout, buffer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, LogStream::Stderr, buffer.clone()));
        }

        let waited = match spec.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => Some(result),
                Err(_) => {
                    warn!(command = %command_line, ?timeout, "Process timed out, killing it");
                    #[cfg(unix)]
                    kill_process_group(child.id());
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed out process");
                    }
                    None
                }
            },
            None => Some(child.wait().await),
        };

        drain_readers(readers).await;

        let output = take_output(&buffer);

        match waited {
            None => ProcessOutcome::TimedOut {
                after: spec.timeout.unwrap_or_default(),
                output,
            },
            Some(Ok(status)) if status.success() => {
                debug!(command = %command_line, "Process exited successfully");
                ProcessOutcome::Succeeded { output }
            }
            Some(Ok(status)) => {
                info!(command = %command_line, exit_code = ?status.code(), "Process failed");
                ProcessOutcome::Failed {
                    exit_code: status.code(),
                    spawned: true,
                    output,
                }
            }
            Some(Err(e)) => ProcessOutcome::Failed {
                exit_code: None,
                spawned: true,
                output: format!("{}\nfailed to wait for {}: {}", output, spec.program, e),
            },
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: LogStream,
    buffer: Arc<Mutex<OutputBuffer>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&raw).trim_end().to_string(),
                    };
                    match line.stream {
                        LogStream::Stdout => {
                            info!(target: "forgeline::process", "{}", line.content)
                        }
                        LogStream::Stderr => {
                            info!(target: "forgeline::process", stream = "stderr", "{}", line.content)
                        }
                    }
                    if let Ok(mut buffer) = buffer.lock() {
                        buffer.push(&line);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Process output stream error");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        warn!(pgid = pid, error = %e, "Failed to kill process group");
    }
}

/// Wait for both output readers under one shared deadline.
async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let handles: Vec<_> = readers.iter().map(|reader| reader.abort_handle()).collect();
    if tokio::time::timeout(READER_GRACE, join_all(readers))
        .await
        .is_err()
    {
        debug!("Output pipe still open after process exit, detaching readers");
        for handle in handles {
            handle.abort();
        }
    }
}

fn take_output(buffer: &Mutex<OutputBuffer>) -> String {
    buffer
        .lock()
        .map(|mut b| std::mem::take(&mut *b).finish())
        .unwrap_or_default()
}

/// Interleaved stdout/stderr, keeping only the most recent `limit` bytes.
#[derive(Debug, Default)]
struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, line: &LogLine) {
        self.text.push_str(&line.content);
        self.text.push('\n');

        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    fn finish(self) -> String {
        if self.truncated {
            format!("[earlier output truncated]\n{}", self.text)
        } else {
            self.text
        }
    }
}
