//! Usage: Spawn the authentication worker with captured output, graceful-then-forced cancel.
//!
//! `WorkerProcess::wait` consumes the handle, so each worker's exit is observed exactly once.
//! On unix the worker leads its own process group; signals go to the whole group so helpers
//! it started cannot outlive it.

use crate::shared::error::OAuthError;
use serde::Serialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};

const READ_BUF_SIZE: usize = 4096;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<OsString>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Cloneable cancel trigger shared between the orchestrator and the waiting task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Returns `true` for the first request only; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        // `notify_one` stores a permit, so a cancel that races ahead of `wait` is not lost.
        self.notify.notify_one();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the worker was terminated by a signal.
    pub code: Option<i32>,
    pub cancel_requested: bool,
    /// The grace period elapsed and the worker was killed.
    pub forced: bool,
}

#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    cancel: CancelHandle,
    grace: Duration,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn wait(mut self) -> ExitReport {
        let exited = tokio::select! {
            biased;
            status = self.child.wait() => Some(status),
            _ = self.cancel.notify.notified() => None,
        };

        let report = match exited {
            Some(Ok(status)) => exit_report(status, self.cancel.is_requested(), false),
            Some(Err(err)) => {
                tracing::warn!(pid = ?self.pid, "waiting for worker failed: {}", err);
                ExitReport {
                    code: None,
                    cancel_requested: self.cancel.is_requested(),
                    forced: false,
                }
            }
            None => return self.terminate().await,
        };
        kill_leftover_group(self.pid);
        report
    }

    async fn terminate(mut self) -> ExitReport {
        tracing::info!(pid = ?self.pid, grace_ms = self.grace.as_millis() as u64, "terminating worker");
        request_graceful_exit(&mut self.child, self.pid);

        let report = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => exit_report(status, true, false),
            Ok(Err(err)) => {
                tracing::warn!(pid = ?self.pid, "waiting for terminated worker failed: {}", err);
                ExitReport {
                    code: None,
                    cancel_requested: true,
                    forced: false,
                }
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "worker ignored termination, killing");
                force_kill(&mut self.child, self.pid);
                let code = self.child.wait().await.ok().and_then(|s| s.code());
                ExitReport {
                    code,
                    cancel_requested: true,
                    forced: true,
                }
            }
        };
        kill_leftover_group(self.pid);
        report
    }
}

fn exit_report(status: ExitStatus, cancel_requested: bool, forced: bool) -> ExitReport {
    ExitReport {
        code: status.code(),
        cancel_requested,
        forced,
    }
}

/// Signal the worker's process group (its pgid is its pid). A group that is already gone
/// counts as delivered.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) -> bool {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0) else {
        return false;
    };
    // SAFETY: plain signal delivery to the group our own child leads.
    let result = unsafe { libc::killpg(pgid, signal) };
    if result != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pgid, signal, "signalling worker group failed: {}", errno);
            return false;
        }
    }
    true
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child, pid: Option<u32>) {
    if !signal_group(pid, libc::SIGTERM) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(child: &mut Child, _pid: Option<u32>) {
    if let Err(err) = child.start_kill() {
        tracing::debug!("worker kill failed: {}", err);
    }
}

fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
    if let Err(err) = child.start_kill() {
        tracing::debug!(pid = ?pid, "worker kill failed: {}", err);
    }
}

/// The worker has exited; anything still running in its group is an orphaned helper.
#[cfg(unix)]
fn kill_leftover_group(pid: Option<u32>) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn kill_leftover_group(_pid: Option<u32>) {}

fn forward_stream<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stream,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(stream = stream.as_str(), "worker output read failed: {}", err);
                    break;
                }
            }
        }
    });
}

/// Start the worker. The receiver yields raw chunks per stream in arrival order and
/// closes once both pipes reach end of stream. `cancel` may already be triggered; the
/// worker is then terminated as soon as it is awaited.
pub fn spawn(
    command: &WorkerCommand,
    grace: Duration,
    cancel: CancelHandle,
) -> Result<(WorkerProcess, mpsc::Receiver<OutputChunk>), OAuthError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|e| {
        OAuthError::Spawn(format!(
            "{}: {e}",
            std::path::Path::new(&command.program).display()
        ))
    })?;
    let pid = child.id();

    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        forward_stream(stdout, StreamKind::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_stream(stderr, StreamKind::Stderr, tx);
    }

    tracing::debug!(pid = ?pid, "worker spawned");
    Ok((
        WorkerProcess {
            child,
            pid,
            cancel,
            grace,
        },
        rx,
    ))
}
