//! Per-connection session: authenticate, then route frames to children.
//!
//! A session owns every child it launches.  The read half routes STDIN/KILL
//! frames to per-child supervisor tasks by `child_id`; a single writer task
//! owns the write half behind a bounded queue, which keeps frames for one
//! child in order while letting children interleave.  When the connection
//! goes away, surviving children get SIGTERM and, after the grace, SIGKILL.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

use forker_exec as exec;
use forker_protocol::{
    Cookie, ExitStatus, Frame, LaunchError, read_frame_or_eof, write_frame,
};

use crate::spawn::{self, LaunchedChild};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause before answering a bad cookie, to blunt brute-force probing.
const REJECT_DELAY: Duration = Duration::from_millis(250);
const WRITER_QUEUE: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

// Signal numbers, spelled out so non-POSIX builds still compile.
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;
const EPERM: i32 = 1;

pub(crate) struct SessionContext {
    pub cookie: Cookie,
    pub grace: Duration,
    pub stdin_queue: usize,
    pub peer: String,
}

enum ChildControl {
    Signal(i32),
    Shutdown,
}

struct ChildHandle {
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    control_tx: mpsc::UnboundedSender<ChildControl>,
}

pub(crate) async fn handle_session<S>(stream: S, ctx: SessionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(WRITER_QUEUE);
    let writer_task = tokio::spawn(write_frames(writer, frame_rx));

    if authenticate(&mut reader, &frame_tx, &ctx).await {
        info!(peer = %ctx.peer, "session ready");
        serve_frames(&mut reader, &frame_tx, &ctx).await;
    }

    drop(frame_tx);
    let _ = writer_task.await;
}

/// NEW → READY transition: the first frame must be a HELLO carrying the
/// daemon's cookie.  Anything else closes the connection with no LAUNCH
/// ever processed.
async fn authenticate<R>(
    reader: &mut R,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &SessionContext,
) -> bool
where
    R: AsyncRead + Unpin,
{
    match timeout(HELLO_TIMEOUT, read_frame_or_eof(reader)).await {
        Ok(Ok(Some(Frame::Hello { cookie }))) if ctx.cookie.matches(&cookie) => {
            frame_tx.send(Frame::HelloOk).await.is_ok()
        }
        Ok(Ok(Some(Frame::Hello { .. }))) => {
            warn!(peer = %ctx.peer, "cookie mismatch, rejecting client");
            sleep(REJECT_DELAY).await;
            let _ = frame_tx
                .send(Frame::HelloReject {
                    reason: "cookie mismatch".to_string(),
                })
                .await;
            false
        }
        Ok(Ok(Some(_))) => {
            warn!(peer = %ctx.peer, "first frame was not HELLO");
            let _ = frame_tx
                .send(Frame::HelloReject {
                    reason: "expected HELLO".to_string(),
                })
                .await;
            false
        }
        Ok(Ok(None)) => false,
        Ok(Err(err)) => {
            warn!(peer = %ctx.peer, %err, "handshake failed");
            false
        }
        Err(_) => {
            debug!(peer = %ctx.peer, "HELLO timeout");
            false
        }
    }
}

/// READY/RUNNING loop.  Returns when the client disconnects or violates the
/// protocol; children surviving at that point are shut down with the grace
/// escalation.
async fn serve_frames<R>(
    reader: &mut R,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &SessionContext,
) where
    R: AsyncRead + Unpin,
{
    let mut children: HashMap<u32, ChildHandle> = HashMap::new();
    let (reaped_tx, mut reaped_rx) = mpsc::channel::<u32>(16);

    loop {
        tokio::select! {
            next = read_frame_or_eof(reader) => match next {
                Ok(Some(frame)) => {
                    if !handle_frame(frame, &mut children, frame_tx, &reaped_tx, ctx).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %ctx.peer, "client disconnected");
                    break;
                }
                Err(err) => {
                    warn!(peer = %ctx.peer, %err, "protocol error, closing session");
                    break;
                }
            },
            Some(child_id) = reaped_rx.recv() => {
                children.remove(&child_id);
            }
        }
    }

    for (child_id, handle) in children.drain() {
        debug!(peer = %ctx.peer, child_id, "terminating orphaned child");
        let _ = handle.control_tx.send(ChildControl::Shutdown);
    }
}

/// Routes one client frame.  Returns `false` to close the session.
async fn handle_frame(
    frame: Frame,
    children: &mut HashMap<u32, ChildHandle>,
    frame_tx: &mpsc::Sender<Frame>,
    reaped_tx: &mpsc::Sender<u32>,
    ctx: &SessionContext,
) -> bool {
    match frame {
        Frame::Ping => frame_tx.send(Frame::Pong).await.is_ok(),
        Frame::Launch { child_id, spec } => {
            if children.contains_key(&child_id) {
                return frame_tx
                    .send(Frame::Failed {
                        child_id,
                        reason: "child id already in use".to_string(),
                        errno: 0,
                    })
                    .await
                    .is_ok();
            }
            match spawn::launch_child(&spec) {
                Ok(launched) => {
                    let pid = launched.pid;
                    // LAUNCHED must enter the write queue before any output
                    // frame, so enqueue it before the supervisor starts.
                    let accepted = frame_tx
                        .send(Frame::Launched { child_id, pid })
                        .await
                        .is_ok();
                    let (stdin_tx, stdin_rx) = mpsc::channel(ctx.stdin_queue.max(1));
                    let (control_tx, control_rx) = mpsc::unbounded_channel();
                    tokio::spawn(supervise(
                        child_id,
                        launched,
                        stdin_rx,
                        control_rx,
                        frame_tx.clone(),
                        reaped_tx.clone(),
                        ctx.grace,
                    ));
                    if !accepted {
                        // Connection died under us; reap the child now.
                        let _ = control_tx.send(ChildControl::Shutdown);
                        return false;
                    }
                    children.insert(
                        child_id,
                        ChildHandle {
                            stdin_tx: Some(stdin_tx),
                            control_tx,
                        },
                    );
                    true
                }
                Err(err) => {
                    debug!(peer = %ctx.peer, child_id, %err, "launch refused");
                    frame_tx
                        .send(Frame::Failed {
                            child_id,
                            reason: err.to_string(),
                            errno: errno_of(&err),
                        })
                        .await
                        .is_ok()
                }
            }
        }
        Frame::Stdin { child_id, data } => {
            if let Some(handle) = children.get(&child_id) {
                if let Some(tx) = &handle.stdin_tx {
                    // Bounded queue: awaiting here stops the session reader,
                    // which is exactly the backpressure contract.
                    let _ = tx.send(data).await;
                }
            }
            true
        }
        Frame::StdinClose { child_id } => {
            if let Some(handle) = children.get_mut(&child_id) {
                handle.stdin_tx = None;
            }
            true
        }
        Frame::Kill { child_id, signal } => {
            // Unknown ids are fine: kill is idempotent after exit.
            if let Some(handle) = children.get(&child_id) {
                let _ = handle.control_tx.send(ChildControl::Signal(signal));
            }
            true
        }
        Frame::Pong => true,
        other => {
            warn!(peer = %ctx.peer, ?other, "client sent a server-only frame");
            false
        }
    }
}

fn errno_of(err: &LaunchError) -> i32 {
    match err {
        LaunchError::ExecFailed { errno, .. } => *errno,
        LaunchError::ElevationDenied => EPERM,
        _ => 0,
    }
}

/// Owns one child to completion: feeds stdin, forwards signals, escalates
/// SIGTERM → SIGKILL on shutdown, and emits the final EXIT after the output
/// pumps have drained.
async fn supervise(
    child_id: u32,
    mut launched: LaunchedChild,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut control_rx: mpsc::UnboundedReceiver<ChildControl>,
    frame_tx: mpsc::Sender<Frame>,
    reaped_tx: mpsc::Sender<u32>,
    grace: Duration,
) {
    let pid = launched.pid;
    let mut stdin = launched.child.stdin.take();
    let stdout_task = launched
        .child
        .stdout
        .take()
        .map(|src| tokio::spawn(pump_output(src, child_id, frame_tx.clone(), true)));
    let stderr_task = launched
        .child
        .stderr
        .take()
        .map(|src| tokio::spawn(pump_output(src, child_id, frame_tx.clone(), false)));

    let mut stdin_open = true;
    let mut control_open = true;
    let mut killing = false;
    let mut deadline = Instant::now();

    let status = loop {
        tokio::select! {
            result = launched.child.wait() => break result,
            // Keep draining the queue even after the child's stdin is gone,
            // otherwise a full queue would wedge the session reader.
            event = stdin_rx.recv(), if stdin_open => match event {
                Some(data) => {
                    if let Some(sink) = stdin.as_mut() {
                        if sink.write_all(&data).await.is_err() {
                            // Child closed its end; swallow further input.
                            stdin = None;
                        }
                    }
                }
                // STDIN_CLOSE (or session teardown): dropping the handle
                // delivers EOF.
                None => {
                    stdin = None;
                    stdin_open = false;
                }
            },
            control = control_rx.recv(), if control_open => match control {
                Some(ChildControl::Signal(signal)) => {
                    let _ = exec::signal_group(pid, signal);
                }
                Some(ChildControl::Shutdown) => {
                    let _ = exec::signal_group(pid, SIGTERM);
                    killing = true;
                    deadline = Instant::now() + grace;
                }
                None => control_open = false,
            },
            _ = sleep_until(deadline), if killing => {
                debug!(child_id, pid, "grace expired, sending SIGKILL");
                let _ = exec::signal_group(pid, SIGKILL);
                killing = false;
            }
        }
    };

    // EXIT is the final frame for this child: wait for the pumps to forward
    // everything the pipes still hold.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let exit = match status {
        Ok(status) => ExitStatus::from_std(status),
        Err(err) => {
            warn!(child_id, pid, %err, "wait failed");
            ExitStatus::from_code(255)
        }
    };
    debug!(child_id, pid, status = exit.to_wire(), "child exited");
    let _ = frame_tx
        .send(Frame::Exit {
            child_id,
            status: exit.to_wire(),
        })
        .await;
    let _ = reaped_tx.send(child_id).await;
}

/// Forwards one child stream, chunk by chunk, in byte order.
async fn pump_output<R>(mut src: R, child_id: u32, frame_tx: mpsc::Sender<Frame>, is_stdout: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = buf[..n].to_vec();
                let frame = if is_stdout {
                    Frame::Stdout { child_id, data }
                } else {
                    Frame::Stderr { child_id, data }
                };
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Single owner of the write half; frames leave in queue order.
async fn write_frames<W>(mut writer: W, mut frame_rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frame_rx.recv().await {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
}
