//! Invocation of staged tools.
//!
//! A tool runs with exactly the environment the caller passes, a null stdin
//! and a deadline. Each output stream is captured up to a byte limit; the
//! rest is drained so the child never blocks on a full pipe.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::StagedTool;
use crate::{Error, Result};

/// Default per-stream capture limit (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Default deadline for an invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Arguments, environment and limits for one invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// The complete child environment. Nothing is inherited.
    pub env: BTreeMap<String, String>,
    /// Deadline; the invoker default applies when unset.
    pub timeout: Option<Duration>,
    /// Working directory; the staged root when unset.
    pub working_dir: Option<PathBuf>,
}

impl InvocationRequest {
    /// Create a request with the given arguments.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Outcome of a completed invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    /// Exit code; `None` when the child was ended by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout (lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8).
    pub stderr: String,
    /// Whether stdout exceeded the capture limit.
    pub stdout_truncated: bool,
    /// Whether stderr exceeded the capture limit.
    pub stderr_truncated: bool,
    /// Wall time from spawn to exit.
    pub duration: Duration,
}

impl InvocationResult {
    /// Whether the tool exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Whether any stream was truncated.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

/// Runs staged tools as child processes.
#[derive(Debug, Clone)]
pub struct Invoker {
    max_output_bytes: usize,
    default_timeout: Duration,
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT)
    }
}

type Captured = (Vec<u8>, bool);

enum Outcome {
    Finished(Result<(ExitStatus, Captured, Captured)>),
    TimedOut,
    Cancelled,
}

impl Invoker {
    /// Create an invoker with a per-stream capture limit and a default deadline.
    #[must_use]
    pub const fn new(max_output_bytes: usize, default_timeout: Duration) -> Self {
        Self {
            max_output_bytes,
            default_timeout,
        }
    }

    /// Per-stream capture limit.
    #[must_use]
    pub const fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Run a staged tool to completion.
    ///
    /// # Errors
    ///
    /// Returns `Spawn` if the executable cannot be started and
    /// `TimeoutExceeded` if it outlives its deadline.
    pub async fn invoke(
        &self,
        tool: &StagedTool,
        request: &InvocationRequest,
    ) -> Result<InvocationResult> {
        self.invoke_with_cancel(tool, request, &CancellationToken::new())
            .await
    }

    /// Run a staged tool, killing it if `cancel` fires first.
    ///
    /// # Errors
    ///
    /// As [`Invoker::invoke`], plus `Cancelled` when the token fires.
    pub async fn invoke_with_cancel(
        &self,
        tool: &StagedTool,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult> {
        let deadline = request.timeout.unwrap_or(self.default_timeout);
        let working_dir = request.working_dir.as_ref().unwrap_or(&tool.root);

        let mut cmd = Command::new(&tool.executable);
        cmd.args(&request.args)
            .env_clear()
            .envs(&request.env)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            tool = %tool.name,
            version = %tool.version,
            args = ?request.args,
            timeout_ms = deadline.as_millis(),
            "Invoking tool"
        );

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            executable: tool.executable.clone(),
            source: Arc::new(e),
        })?;
        let pid = child.id();

        let mut stdout = spawn_capture(child.stdout.take(), self.max_output_bytes);
        let mut stderr = spawn_capture(child.stderr.take(), self.max_output_bytes);

        // One deadline covers the exit and the output streams; a grandchild
        // holding the pipes open must not outlive it.
        let expires = tokio::time::Instant::now() + deadline;
        let outcome = {
            let collected = collect(&mut child, &tool.executable, &mut stdout, &mut stderr);
            tokio::select! {
                finished = tokio::time::timeout_at(expires, collected) => match finished {
                    Ok(collected) => Outcome::Finished(collected),
                    Err(_) => Outcome::TimedOut,
                },
                () = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        let (status, (stdout, stdout_truncated), (stderr, stderr_truncated)) = match outcome {
            Outcome::Finished(collected) => collected?,
            Outcome::TimedOut => {
                warn!(tool = %tool.name, ?pid, timeout_ms = deadline.as_millis(), "Tool timed out, terminating");
                terminate(&mut child, stdout, stderr).await;
                return Err(Error::TimeoutExceeded {
                    tool: tool.name.clone(),
                    timeout: deadline,
                    pid,
                });
            }
            Outcome::Cancelled => {
                info!(tool = %tool.name, ?pid, "Invocation cancelled, terminating");
                terminate(&mut child, stdout, stderr).await;
                return Err(Error::Cancelled {
                    tool: tool.name.clone(),
                    pid,
                });
            }
        };

        let result = InvocationResult {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            stderr_truncated,
            duration: start.elapsed(),
        };

        if result.is_truncated() {
            warn!(
                tool = %tool.name,
                limit = self.max_output_bytes,
                stdout_truncated,
                stderr_truncated,
                "Tool output truncated"
            );
        }
        debug!(
            tool = %tool.name,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis(),
            "Tool exited"
        );
        Ok(result)
    }
}

type Capture = JoinHandle<io::Result<Captured>>;

fn spawn_capture<R>(stream: Option<R>, limit: usize) -> Option<Capture>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream.map(|reader| tokio::spawn(capture(reader, limit)))
}

/// Read `reader` to the end, keeping at most `limit` bytes.
async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<Captured> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    if truncated {
        trim_split_char(&mut kept);
    }
    Ok((kept, truncated))
}

/// Drop a trailing multi-byte UTF-8 character cut short by the capture limit.
fn trim_split_char(bytes: &mut Vec<u8>) {
    let len = bytes.len();
    let Some(start) = (len.saturating_sub(4)..len)
        .rev()
        .find(|&i| bytes[i] & 0xC0 != 0x80)
    else {
        return;
    };
    let width = match bytes[start] {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    };
    if len - start < width {
        bytes.truncate(start);
    }
}

/// Wait for the child to exit and both output streams to close.
async fn collect(
    child: &mut Child,
    executable: &Path,
    stdout: &mut Option<Capture>,
    stderr: &mut Option<Capture>,
) -> Result<(ExitStatus, Captured, Captured)> {
    let status = child
        .wait()
        .await
        .map_err(|e| Error::io(e, Some(executable), "waiting for tool"))?;
    let stdout = join_capture(stdout.as_mut()).await?;
    let stderr = join_capture(stderr.as_mut()).await?;
    Ok((status, stdout, stderr))
}

async fn join_capture(handle: Option<&mut Capture>) -> Result<Captured> {
    let Some(handle) = handle else {
        return Ok((Vec::new(), false));
    };
    handle
        .await
        .map_err(|e| Error::internal(format!("output reader failed: {e}")))?
        .map_err(|e| Error::io(e, None, "reading tool output"))
}

/// Kill the child, reap it, and stop the output readers.
async fn terminate(child: &mut Child, stdout: Option<Capture>, stderr: Option<Capture>) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill failed, child already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap terminated tool");
    }
    for reader in [stdout, stderr].into_iter().flatten() {
        reader.abort();
    }
}
