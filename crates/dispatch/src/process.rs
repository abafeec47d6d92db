//! The unified process handle returned by every launch backend.
//!
//! A handle never owns its daemon session; it names the child (pid plus
//! connection-local id) and talks to it through channels, so dropping the
//! handle can never deadlock the session that owns the child.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};

use forker_exec as exec;
use forker_exec::helper::TempPath;
use forker_protocol::{ExitStatus, Frame, LaunchError, WireError};

pub struct Process {
    pid: u32,
    program: String,
    stdin: Option<ProcessStdin>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    wait_route: WaitRoute,
    kill_route: KillRoute,
    observed: Option<ExitStatus>,
    /// Keeps the sudo askpass script alive until the child is done.
    _askpass: Option<TempPath>,
}

enum WaitRoute {
    Local(Child),
    Remote(oneshot::Receiver<ExitStatus>),
}

enum KillRoute {
    Local,
    Remote { tx: mpsc::Sender<Frame>, child_id: u32 },
}

pub(crate) struct RemoteParts {
    pub pid: u32,
    pub child_id: u32,
    pub program: String,
    pub writer_tx: mpsc::Sender<Frame>,
    pub stdin: bool,
    pub stdout_rx: Option<mpsc::Receiver<Vec<u8>>>,
    pub stderr_rx: Option<mpsc::Receiver<Vec<u8>>>,
    pub exit_rx: oneshot::Receiver<ExitStatus>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("observed", &self.observed)
            .finish()
    }
}

impl Process {
    pub(crate) fn from_local(
        mut child: Child,
        program: String,
        askpass: Option<TempPath>,
    ) -> Self {
        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take().map(|s| ProcessStdin(StdinInner::Local(s)));
        let stdout = child
            .stdout
            .take()
            .map(|s| OutputStream(OutputInner::LocalOut(s)));
        let stderr = child
            .stderr
            .take()
            .map(|s| OutputStream(OutputInner::LocalErr(s)));
        Self {
            pid,
            program,
            stdin,
            stdout,
            stderr,
            wait_route: WaitRoute::Local(child),
            kill_route: KillRoute::Local,
            observed: None,
            _askpass: askpass,
        }
    }

    pub(crate) fn from_remote(parts: RemoteParts) -> Self {
        let stdin = parts.stdin.then(|| {
            ProcessStdin(StdinInner::Remote {
                tx: parts.writer_tx.clone(),
                child_id: parts.child_id,
            })
        });
        let stdout = parts.stdout_rx.map(|rx| {
            OutputStream(OutputInner::Remote {
                rx,
                pending: Vec::new(),
                offset: 0,
            })
        });
        let stderr = parts.stderr_rx.map(|rx| {
            OutputStream(OutputInner::Remote {
                rx,
                pending: Vec::new(),
                offset: 0,
            })
        });
        Self {
            pid: parts.pid,
            program: parts.program,
            stdin,
            stdout,
            stderr,
            wait_route: WaitRoute::Remote(parts.exit_rx),
            kill_route: KillRoute::Remote {
                tx: parts.writer_tx,
                child_id: parts.child_id,
            },
            observed: None,
            _askpass: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<ProcessStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    /// Blocks until the child exits.  Further calls return the same status.
    pub async fn wait(&mut self) -> Result<ExitStatus, LaunchError> {
        if let Some(status) = self.observed {
            return Ok(status);
        }
        let status = match &mut self.wait_route {
            WaitRoute::Local(child) => match child.wait().await {
                Ok(status) => ExitStatus::from_std(status),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    return Err(LaunchError::Interrupted);
                }
                Err(err) => return Err(LaunchError::exec_failed(&self.program, &err)),
            },
            WaitRoute::Remote(exit_rx) => exit_rx
                .await
                .map_err(|_| LaunchError::Protocol(WireError::UnexpectedEof))?,
        };
        self.observed = Some(status);
        Ok(status)
    }

    /// Queues `signal` for the child.  Success means delivery was requested,
    /// not that the child is gone; after exit this is a no-op.
    pub async fn kill(&mut self, signal: i32) -> Result<(), LaunchError> {
        if self.observed.is_some() {
            return Ok(());
        }
        match &self.kill_route {
            KillRoute::Local => exec::signal_process(self.pid, signal)
                .map_err(|err| LaunchError::exec_failed(&self.program, &err)),
            KillRoute::Remote { tx, child_id } => {
                // A closed writer means the session already saw EXIT.
                let _ = tx
                    .send(Frame::Kill {
                        child_id: *child_id,
                        signal,
                    })
                    .await;
                Ok(())
            }
        }
    }
}

// ── Stdin ────────────────────────────────────────────────────────────────────

pub struct ProcessStdin(StdinInner);

enum StdinInner {
    Local(ChildStdin),
    Remote { tx: mpsc::Sender<Frame>, child_id: u32 },
}

impl ProcessStdin {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), LaunchError> {
        match &mut self.0 {
            StdinInner::Local(sink) => sink
                .write_all(data)
                .await
                .map_err(|err| LaunchError::Protocol(WireError::Io(err))),
            StdinInner::Remote { tx, child_id } => tx
                .send(Frame::Stdin {
                    child_id: *child_id,
                    data: data.to_vec(),
                })
                .await
                .map_err(|_| LaunchError::Protocol(WireError::UnexpectedEof)),
        }
    }

    /// Delivers EOF to the child.
    pub async fn close(self) -> Result<(), LaunchError> {
        match self.0 {
            StdinInner::Local(sink) => {
                drop(sink);
                Ok(())
            }
            StdinInner::Remote { tx, child_id } => {
                let _ = tx.send(Frame::StdinClose { child_id }).await;
                Ok(())
            }
        }
    }
}

// ── Stdout / stderr ──────────────────────────────────────────────────────────

/// Readable child output.  Local launches read the pipe directly; daemon
/// launches read demultiplexed frames.  EOF arrives when the child closes
/// the stream (locally) or when the daemon forwards the child's EOF.
pub struct OutputStream(OutputInner);

enum OutputInner {
    LocalOut(ChildStdout),
    LocalErr(ChildStderr),
    Remote {
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
        offset: usize,
    },
}

impl AsyncRead for OutputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().0 {
            OutputInner::LocalOut(stream) => Pin::new(stream).poll_read(cx, buf),
            OutputInner::LocalErr(stream) => Pin::new(stream).poll_read(cx, buf),
            OutputInner::Remote {
                rx,
                pending,
                offset,
            } => loop {
                if *offset < pending.len() {
                    let n = buf.remaining().min(pending.len() - *offset);
                    buf.put_slice(&pending[*offset..*offset + n]);
                    *offset += n;
                    return Poll::Ready(Ok(()));
                }
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(chunk)) => {
                        *pending = chunk;
                        *offset = 0;
                    }
                    // Channel closed: the child's EOF.
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            },
        }
    }
}
