//! External tool invocation.
//!
//! The pipeline only sees [`CommandRunner`]: give it a [`ToolCommand`], get
//! back the exit code and captured output. [`ProcessRunner`] is the real
//! implementation on top of `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tracing::{info, warn};

/// A single tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Emit a liveness log line at this cadence while the process runs.
    pub heartbeat: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            heartbeat: None,
        }
    }

    pub fn args(mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = Some(every);
        self
    }

    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

/// Output captured from a finished process.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("I/O error waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, RunError>;
}

/// Runs tools as child processes. The child is killed if it outlives its
/// timeout or if the calling future is dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, RunError> {
        let program = command.name();
        let started = Instant::now();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (last_line_tx, last_line_rx) = watch::channel(String::new());
        let stdout_task = tokio::spawn(collect_output(child.stdout.take(), None));
        let stderr_task = tokio::spawn(collect_output(child.stderr.take(), Some(last_line_tx)));

        let mut ticker = command
            .heartbeat
            .map(|every| tokio::time::interval_at(started + every, every));

        let wait = async {
            loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = tick(&mut ticker) => {
                        let last_line = last_line_rx.borrow().clone();
                        info!(
                            tool = %program,
                            elapsed_secs = started.elapsed().as_secs(),
                            last_output = %last_line,
                            "⏳ Still running"
                        );
                    }
                }
            }
        };
        let outcome = tokio::time::timeout(command.timeout, wait).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => return Err(RunError::Wait { program, source }),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {} after timeout: {}", program, e);
                }
                return Err(RunError::TimedOut {
                    program,
                    timeout: command.timeout,
                });
            }
        };

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout: stdout_task.await.unwrap_or_default(),
            stderr: stderr_task.await.unwrap_or_default(),
            elapsed: started.elapsed(),
        })
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Drain a child pipe line by line, publishing the latest line for
/// heartbeat sampling.
async fn collect_output<R>(reader: Option<R>, last_line: Option<watch::Sender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };

    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if let Some(tx) = &last_line {
                    tx.send_replace(line.trim_end().to_string());
                }
                collected.push_str(&line);
            }
        }
    }

    collected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5))
            .args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = ProcessRunner.run(&cmd).await.unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let cmd = ToolCommand::new("nonexistent_tool_xyz_12345", Duration::from_secs(1));
        let err = ProcessRunner.run(&cmd).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let cmd = ToolCommand::new("sleep", Duration::from_millis(100)).args(["10"]);
        let started = std::time::Instant::now();
        let err = ProcessRunner.run(&cmd).await.unwrap_err();

        assert!(matches!(err, RunError::TimedOut { .. }), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn heartbeat_does_not_change_the_result() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5))
            .args(["-c", "echo tick >&2; sleep 0.3; echo done"])
            .heartbeat(Duration::from_millis(50));
        let output = ProcessRunner.run(&cmd).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
    }
}
