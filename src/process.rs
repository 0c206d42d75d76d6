//! Shell command execution.
//!
//! The composed test command is handed to `sh -c` in the workspace with the
//! step's environment. Output is streamed line by line to a callback while
//! the process runs. A run ends in one of three ways:
//!
//! | End | Result | Retried |
//! |-----|--------|---------|
//! | process exits (any code) | `Ok(ExecOutcome)` | when the code is non-zero |
//! | timeout elapses | `Err(ProcessError::Timeout)`, process killed | yes |
//! | cancellation token fires | `Err(ProcessError::Cancelled)`, process killed | no |
//!
//! The shell leads its own process group; a kill reaches every process the
//! script started, not just the shell.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// A line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Receives output lines as they are produced.
pub type OutputCallback = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// Result type for process execution.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors raised while running a command.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The shell could not be started.
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    /// The command outlived its timeout and was killed.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled and the command was killed.
    #[error("command cancelled")]
    Cancelled,

    /// Waiting for the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessError::Cancelled)
    }
}

/// A command to run.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Script passed to `sh -c`.
    pub command: String,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Environment added to the inherited one.
    pub env: HashMap<String, String>,
    /// Maximum run time.
    pub timeout: Duration,
}

/// How a finished command exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit code; -1 when the process was ended by a signal.
    pub exit_code: i32,
    /// Wall-clock run time.
    pub duration: Duration,
}

impl ExecOutcome {
    /// Returns `true` for exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `request` to completion, timeout or cancellation.
    async fn execute(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> ProcessResult<ExecOutcome>;
}

/// Executes commands with a local shell.
pub struct ShellExecutor {
    shell: String,
    on_output: OutputCallback,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    /// Creates an executor using `sh` that forwards output to `tracing`.
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            on_output: Arc::new(|line: &OutputLine| match line {
                OutputLine::Stdout(l) => tracing::info!(target: "tirun::output", "{}", l),
                OutputLine::Stderr(l) => tracing::warn!(target: "tirun::output", "{}", l),
            }),
        }
    }

    /// Sets the output callback.
    pub fn with_output(mut self, on_output: OutputCallback) -> Self {
        self.on_output = on_output;
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> ProcessResult<ExecOutcome> {
        let start = Instant::now();

        let mut process = tokio::process::Command::new(&self.shell);
        process
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(ProcessError::Spawn)?;

        let stdout = child.stdout.take().map(|out| {
            tokio_stream::wrappers::LinesStream::new(BufReader::new(out).lines())
                .map(|line| OutputLine::Stdout(line.unwrap_or_default()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio_stream::wrappers::LinesStream::new(BufReader::new(err).lines())
                .map(|line| OutputLine::Stderr(line.unwrap_or_default()))
        });
        let mut lines = stream::select(
            stream::iter(stdout).flatten(),
            stream::iter(stderr).flatten(),
        );

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(line) => (self.on_output)(&line),
                    None => break,
                },
                _ = &mut deadline => {
                    kill_group(&mut child).await;
                    return Err(ProcessError::Timeout(request.timeout));
                }
                _ = cancel.cancelled() => {
                    kill_group(&mut child).await;
                    return Err(ProcessError::Cancelled);
                }
            }
        }

        let ended = tokio::select! {
            status = child.wait() => Ok(status?),
            _ = &mut deadline => Err(ProcessError::Timeout(request.timeout)),
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
        };
        let status = match ended {
            Ok(status) => status,
            Err(e) => {
                kill_group(&mut child).await;
                return Err(e);
            }
        };

        Ok(ExecOutcome {
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }
}

/// Hard-kills the shell's process group, then the shell itself.
async fn kill_group(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        signal_group(pid);
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn signal_group(pgid: u32) {
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group
    // created with `process_group(0)` at spawn.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn request(dir: &TempDir, command: &str, timeout: Duration) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            working_dir: dir.path().to_path_buf(),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            timeout,
        }
    }

    fn capturing() -> (ShellExecutor, Arc<Mutex<Vec<OutputLine>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let executor = ShellExecutor::new().with_output(Arc::new(move |line: &OutputLine| {
            sink.lock().unwrap().push(line.clone());
        }));
        (executor, lines)
    }

    #[tokio::test]
    async fn test_streams_output_with_env() {
        let dir = TempDir::new().unwrap();
        let (executor, lines) = capturing();
        let outcome = executor
            .execute(
                &request(&dir, "echo $GREETING; echo oops >&2", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.success());
        let lines = lines.lock().unwrap();
        assert!(lines.contains(&OutputLine::Stdout("hello".into())));
        assert!(lines.contains(&OutputLine::Stderr("oops".into())));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_outcome() {
        let dir = TempDir::new().unwrap();
        let outcome = ShellExecutor::new()
            .execute(
                &request(&dir, "exit 3", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let start = Instant::now();
        let err = ShellExecutor::new()
            .execute(
                &request(&dir, "sleep 30", Duration::from_millis(200)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        // A killed process may linger as a zombie until it is reaped.
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| {
                stat.rsplit_once(')')
                    .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_processes_started_by_script() {
        let dir = TempDir::new().unwrap();
        let script = "set -xe\nsh -c 'echo $$ > pid; exec sleep 30'\necho after";
        let err = ShellExecutor::new()
            .execute(
                &request(&dir, script, Duration::from_millis(500)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));

        let pid = std::fs::read_to_string(dir.path().join("pid")).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(pid), "process {} survived the kill", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancellation_kills_processes_started_by_script() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let script = "set -e\nsh -c 'echo $$ > pid; exec sleep 30'\necho after";
        let err = ShellExecutor::new()
            .execute(&request(&dir, script, Duration::from_secs(60)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));

        let pid = std::fs::read_to_string(dir.path().join("pid")).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(pid), "process {} survived the kill", pid);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = ShellExecutor::new()
            .execute(&request(&dir, "sleep 30", Duration::from_secs(60)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = TempDir::new().unwrap();
        ShellExecutor::new()
            .execute(
                &request(&dir, "touch marker", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(dir.path().join("marker").exists());
    }
}
