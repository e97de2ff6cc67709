//! Spawns one shell command, streams its output and enforces its timeout.

use super::ProcessHandle;
use crate::cancellation::CancellationToken;
use crate::core::OutputStream;
use crate::errors::ProcessError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Time between the graceful terminate signal and the forceful kill.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_millis(5000);

/// How long output is still drained after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);

#[cfg(unix)]
const DEFAULT_SHELL: &str = "sh";
#[cfg(not(unix))]
const DEFAULT_SHELL: &str = "cmd";

/// A command to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// The command line, interpreted by the shell.
    pub command: String,
    /// Working directory; the runner's own directory when unset.
    pub cwd: Option<PathBuf>,
    /// Hard timeout; unlimited when unset.
    pub timeout: Option<Duration>,
    /// Environment overrides, applied over the runner's base environment.
    pub env: HashMap<String, String>,
    /// Shell override (e.g. `bash`).
    pub shell: Option<String>,
}

impl ProcessSpec {
    /// Creates a spec for a command line.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds environment overrides.
    #[must_use]
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Sets the shell.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

/// One line of output from a running command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// The stream the line came from.
    pub stream: OutputStream,
    /// The line, without its terminator.
    pub chunk: String,
}

/// Callback receiving output as it is produced.
pub type OutputObserver = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// The exit code (always 0 for a successful run).
    pub exit_code: i32,
    /// Captured stdout lines.
    pub stdout: Vec<String>,
    /// Captured stderr lines.
    pub stderr: Vec<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout,
    Cancelled,
}

/// Runs external commands one at a time.
///
/// Each spawned command gets its own process group so that termination
/// signals reach every descendant. The command currently running is tracked
/// in a [`ProcessHandle`] which other tasks use to cancel it.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    base_env: HashMap<String, String>,
    handle: Arc<ProcessHandle>,
    grace_period: Option<Duration>,
}

impl ProcessRunner {
    /// Creates a runner that inherits the parent environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base environment layered under every command's overrides.
    #[must_use]
    pub fn with_base_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    /// Overrides the kill grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Returns the handle tracking this runner's current process.
    #[must_use]
    pub fn handle(&self) -> Arc<ProcessHandle> {
        self.handle.clone()
    }

    /// Cancels the current process, if any.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Returns the base environment.
    #[must_use]
    pub fn base_env(&self) -> &HashMap<String, String> {
        &self.base_env
    }

    fn grace(&self) -> Duration {
        self.grace_period.unwrap_or(KILL_GRACE_PERIOD)
    }

    /// Runs a command and collects its output.
    ///
    /// # Errors
    ///
    /// See [`run_with_observer`](Self::run_with_observer).
    pub async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
        self.run_with_observer(spec, None).await
    }

    /// Runs a command, passing every output line to `observer` as it arrives.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::MissingWorkingDirectory`] / [`ProcessError::Spawn`]
    ///   before the process starts.
    /// - [`ProcessError::TimedOut`] when the timeout expired.
    /// - [`ProcessError::Cancelled`] when the handle was cancelled.
    /// - [`ProcessError::NonZeroExit`] with the full stderr otherwise.
    pub async fn run_with_observer(
        &self,
        spec: &ProcessSpec,
        observer: Option<OutputObserver>,
    ) -> Result<ProcessOutput, ProcessError> {
        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(ProcessError::MissingWorkingDirectory { path: cwd.clone() });
            }
        }

        let mut child = self.spawn(spec)?;
        let pid = child.id();
        let (track_id, cancel) = self.handle.track(&spec.command, pid);
        debug!(command = %spec.command, pid = ?pid, "Spawned process");

        let start = Instant::now();
        let result = self.supervise(&mut child, pid, spec, observer, &cancel).await;
        self.handle.release(track_id);

        let (status, stop, stdout, stderr) = result?;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match stop {
            Some(StopReason::Timeout) => {
                warn!(command = %spec.command, "Process timed out");
                return Err(ProcessError::TimedOut {
                    command: spec.command.clone(),
                    timeout_ms: spec
                        .timeout
                        .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                });
            }
            Some(StopReason::Cancelled) => {
                return Err(ProcessError::Cancelled {
                    command: spec.command.clone(),
                });
            }
            None => {}
        }

        if status.success() {
            debug!(command = %spec.command, duration_ms, "Process completed");
            Ok(ProcessOutput {
                exit_code: 0,
                stdout,
                stderr,
                duration_ms,
            })
        } else {
            Err(ProcessError::NonZeroExit {
                command: spec.command.clone(),
                code: status.code(),
                stderr: stderr.join("\n"),
            })
        }
    }

    /// Runs a command that is cancelled when `token` fires.
    ///
    /// # Errors
    ///
    /// As [`run_with_observer`](Self::run_with_observer); a token that is
    /// already cancelled yields [`ProcessError::Cancelled`] without spawning.
    pub async fn run_until_cancelled(
        &self,
        spec: &ProcessSpec,
        observer: Option<OutputObserver>,
        token: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        if token.is_cancelled() {
            return Err(ProcessError::Cancelled {
                command: spec.command.clone(),
            });
        }

        let run = self.run_with_observer(spec, observer);
        tokio::pin!(run);
        // The first poll of `run` spawns and tracks the child, so a cancel
        // observed afterwards always finds it in the handle.
        tokio::select! {
            biased;
            result = &mut run => result,
            () = token.cancelled() => {
                self.cancel();
                run.await
            }
        }
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<Child, ProcessError> {
        let shell = spec.shell.as_deref().unwrap_or(DEFAULT_SHELL);
        let mut cmd = Command::new(shell);
        if cfg!(unix) {
            cmd.arg("-c");
        } else {
            cmd.arg("/C");
        }
        cmd.arg(&spec.command)
            .envs(&self.base_env)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| ProcessError::Spawn {
            command: spec.command.clone(),
            message: e.to_string(),
        })
    }

    #[allow(clippy::too_many_lines)]
    async fn supervise(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        spec: &ProcessSpec,
        observer: Option<OutputObserver>,
        cancel: &tokio::sync::Notify,
    ) -> Result<(ExitStatus, Option<StopReason>, Vec<String>, Vec<String>), ProcessError> {
        let io_error = |e: std::io::Error| ProcessError::Io {
            command: spec.command.clone(),
            message: e.to_string(),
        };

        let mut stdout_lines = child.stdout.take().map(ChunkReader::new);
        let mut stderr_lines = child.stderr.take().map(ChunkReader::new);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let far_future = Duration::from_secs(60 * 60 * 24 * 365);
        let deadline = tokio::time::sleep(spec.timeout.unwrap_or(far_future));
        tokio::pin!(deadline);
        let kill_at = tokio::time::sleep(far_future);
        tokio::pin!(kill_at);
        let drain_until = tokio::time::sleep(far_future);
        tokio::pin!(drain_until);

        let mut status: Option<ExitStatus> = None;
        let mut stop: Option<StopReason> = None;
        let mut killed = false;

        let emit = |stream: OutputStream, line: &str| {
            if let Some(observer) = &observer {
                observer(&OutputChunk {
                    stream,
                    chunk: line.to_string(),
                });
            }
        };

        loop {
            if status.is_some() && stdout_lines.is_none() && stderr_lines.is_none() {
                break;
            }

            tokio::select! {
                line = next_line(&mut stdout_lines), if stdout_lines.is_some() => match line {
                    Some(line) => {
                        emit(OutputStream::Stdout, &line);
                        stdout_buf.push(line);
                    }
                    None => stdout_lines = None,
                },
                line = next_line(&mut stderr_lines), if stderr_lines.is_some() => match line {
                    Some(line) => {
                        emit(OutputStream::Stderr, &line);
                        stderr_buf.push(line);
                    }
                    None => stderr_lines = None,
                },
                exit = child.wait(), if status.is_none() => {
                    status = Some(exit.map_err(io_error)?);
                    drain_until
                        .as_mut()
                        .reset(tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT);
                },
                () = &mut deadline, if status.is_none() && stop.is_none() && spec.timeout.is_some() => {
                    stop = Some(StopReason::Timeout);
                    self.terminate(child, pid, &spec.command);
                    kill_at.as_mut().reset(tokio::time::Instant::now() + self.grace());
                },
                () = cancel.notified(), if status.is_none() && stop.is_none() => {
                    stop = Some(StopReason::Cancelled);
                    self.terminate(child, pid, &spec.command);
                    kill_at.as_mut().reset(tokio::time::Instant::now() + self.grace());
                },
                () = &mut kill_at, if status.is_none() && stop.is_some() && !killed => {
                    killed = true;
                    warn!(command = %spec.command, "Process ignored terminate signal; killing");
                    force_kill(child, pid);
                },
                () = &mut drain_until, if status.is_some() => {
                    debug!(command = %spec.command, "Output still open after exit; detaching");
                    break;
                },
            }
        }

        let status = match status {
            Some(status) => status,
            None => child.wait().await.map_err(io_error)?,
        };
        Ok((status, stop, stdout_buf, stderr_buf))
    }

    fn terminate(&self, child: &mut Child, pid: Option<u32>, command: &str) {
        info!(command, grace_ms = self.grace().as_millis() as u64, "Sending terminate signal");
        graceful_terminate(child, pid);
    }
}

/// Splits a byte stream into chunks ended by `\n` or `\r`.
///
/// Progress bars redraw with a bare `\r`, so each redraw becomes its own
/// chunk. A `\r\n` pair ends a single chunk. Invalid UTF-8 is replaced
/// rather than ending the stream, so the pipe is always drained.
struct ChunkReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    after_cr: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
            after_cr: false,
        }
    }

    /// Returns the next chunk, or `None` at end of stream.
    ///
    /// Cancel-safe: partial input stays in `pending` between calls.
    async fn next_chunk(&mut self) -> Option<String> {
        loop {
            let buf = match self.inner.fill_buf().await {
                Ok(buf) => buf,
                Err(e) => {
                    debug!(error = %e, "Output stream read failed");
                    return self.take_pending();
                }
            };
            if buf.is_empty() {
                return self.take_pending();
            }

            let Some(pos) = buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                let len = buf.len();
                self.pending.extend_from_slice(buf);
                self.inner.consume(len);
                self.after_cr = false;
                continue;
            };

            let terminator = buf[pos];
            self.pending.extend_from_slice(&buf[..pos]);
            self.inner.consume(pos + 1);

            let crlf = terminator == b'\n' && self.after_cr && self.pending.is_empty();
            self.after_cr = terminator == b'\r';
            if crlf {
                continue;
            }
            let chunk = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            return Some(chunk);
        }
    }

    fn take_pending(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let chunk = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(chunk)
    }
}

async fn next_line<R>(reader: &mut Option<ChunkReader<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.next_chunk().await,
        None => None,
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

#[cfg(unix)]
fn graceful_terminate(child: &mut Child, pid: Option<u32>) {
    let delivered = pid.is_some_and(|pid| signal_group(pid, nix::sys::signal::Signal::SIGTERM));
    if !delivered {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn graceful_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}
