//! Daemon RPC backend: one authenticated connection per launch.
//!
//! The daemon multiplexes any number of children per session by child id;
//! this client keeps its own life simple by dedicating a connection to each
//! launch, so the id is always 1.  Frames for the child are demultiplexed
//! into channels behind the process handle.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use forker_config::{Endpoint, Settings};
use forker_protocol::{
    CommandSpec, Cookie, ExitStatus, Frame, IoMode, LaunchError, cookie,
    read_frame, read_frame_or_eof, write_frame,
};

use crate::process::{Process, RemoteParts};

const CHILD_ID: u32 = 1;
const CHANNEL_DEPTH: usize = 32;

pub(crate) async fn launch(
    settings: &Settings,
    spec: &CommandSpec,
) -> Result<Process, LaunchError> {
    let hello_timeout = Duration::from_millis(settings.client.probe_timeout_ms);
    let cookie = load_cookie(settings)?;
    match settings.endpoint() {
        Endpoint::Tcp(addr) => {
            let stream = timeout(hello_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| daemon_unreachable("connect timed out"))?
                .map_err(|err| daemon_unreachable(&format!("connect failed: {err}")))?;
            let _ = stream.set_nodelay(true);
            start(stream, cookie, spec, hello_timeout).await
        }
        Endpoint::Unix(path) => {
            #[cfg(unix)]
            {
                let stream = timeout(hello_timeout, UnixStream::connect(&path))
                    .await
                    .map_err(|_| daemon_unreachable("connect timed out"))?
                    .map_err(|err| daemon_unreachable(&format!("connect failed: {err}")))?;
                start(stream, cookie, spec, hello_timeout).await
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(daemon_unreachable("unix endpoints unsupported on this platform"))
            }
        }
    }
}

/// Connect-and-HELLO only; used for reachability checks.
pub(crate) async fn probe(settings: &Settings) -> bool {
    let Ok(cookie) = load_cookie(settings) else {
        return false;
    };
    let hello_timeout = Duration::from_millis(settings.client.probe_timeout_ms);
    let attempt = async {
        match settings.endpoint() {
            Endpoint::Tcp(addr) => match TcpStream::connect(addr).await {
                Ok(mut stream) => handshake(&mut stream, &cookie).await.is_ok(),
                Err(_) => false,
            },
            Endpoint::Unix(path) => {
                #[cfg(unix)]
                {
                    match UnixStream::connect(&path).await {
                        Ok(mut stream) => handshake(&mut stream, &cookie).await.is_ok(),
                        Err(_) => false,
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    false
                }
            }
        }
    };
    timeout(hello_timeout, attempt).await.unwrap_or(false)
}

fn load_cookie(settings: &Settings) -> Result<Cookie, LaunchError> {
    cookie::load(&settings.state_dir())
        .map_err(|err| daemon_unreachable(&format!("no usable cookie: {err}")))
}

fn daemon_unreachable(reason: &str) -> LaunchError {
    LaunchError::DaemonUnreachable(reason.to_string())
}

async fn handshake<S>(stream: &mut S, cookie: &Cookie) -> Result<(), LaunchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        stream,
        &Frame::Hello {
            cookie: cookie.bytes().to_vec(),
        },
    )
    .await
    .map_err(|err| daemon_unreachable(&format!("HELLO failed: {err}")))?;
    match read_frame(stream).await {
        Ok(Frame::HelloOk) => Ok(()),
        Ok(Frame::HelloReject { reason }) => {
            Err(daemon_unreachable(&format!("cookie rejected: {reason}")))
        }
        Ok(_) => Err(daemon_unreachable("unexpected handshake reply")),
        Err(err) => Err(daemon_unreachable(&format!("handshake failed: {err}"))),
    }
}

async fn start<S>(
    mut stream: S,
    cookie: Cookie,
    spec: &CommandSpec,
    hello_timeout: Duration,
) -> Result<Process, LaunchError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(hello_timeout, handshake(&mut stream, &cookie))
        .await
        .map_err(|_| daemon_unreachable("HELLO timed out"))??;

    write_frame(
        &mut stream,
        &Frame::Launch {
            child_id: CHILD_ID,
            spec: spec.clone(),
        },
    )
    .await?;

    let pid = match read_frame(&mut stream).await? {
        Frame::Launched { pid, .. } => pid,
        Frame::Failed { reason, errno, .. } => {
            return Err(map_failed(&spec.argv()[0], reason, errno));
        }
        other => {
            debug!(?other, "unexpected reply to LAUNCH");
            return Err(LaunchError::Protocol(
                forker_protocol::WireError::BadValue("reply to LAUNCH"),
            ));
        }
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let (writer_tx, writer_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    tokio::spawn(write_frames(write_half, writer_rx));

    let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let (exit_tx, exit_rx) = oneshot::channel::<ExitStatus>();
    tokio::spawn(demux(read_half, stdout_tx, stderr_tx, exit_tx));

    let (stdin, stdout, stderr) = stream_exposure(spec.mode(), spec.stderr_merged());
    Ok(Process::from_remote(RemoteParts {
        pid,
        child_id: CHILD_ID,
        program: spec.argv()[0].clone(),
        writer_tx,
        stdin,
        stdout_rx: stdout.then_some(stdout_rx),
        stderr_rx: stderr.then_some(stderr_rx),
        exit_rx,
    }))
}

/// Which handle surfaces the client exposes per I/O mode (stdin, stdout,
/// stderr).  The daemon mirrors this table when wiring the child.
fn stream_exposure(mode: IoMode, merged: bool) -> (bool, bool, bool) {
    let err = !merged;
    match mode {
        IoMode::Default | IoMode::Io => (true, true, err),
        IoMode::Input => (false, true, err),
        IoMode::Output => (true, false, false),
        IoMode::Sink | IoMode::System => (false, false, false),
        IoMode::Pty => (false, false, false),
    }
}

/// The daemon reports launch problems as FAILED{reason, errno}; fold them
/// back into the error taxonomy.
fn map_failed(program: &str, reason: String, errno: i32) -> LaunchError {
    if reason.contains("identity switch refused") {
        LaunchError::ElevationDenied
    } else if reason.contains("no elevation mechanism") {
        LaunchError::ElevationUnavailable
    } else if reason.contains("no pty backend") {
        LaunchError::PtyUnavailable
    } else {
        LaunchError::ExecFailed {
            program: program.to_string(),
            errno,
            message: reason,
        }
    }
}

async fn write_frames<W>(mut writer: W, mut frame_rx: mpsc::Receiver<Frame>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = frame_rx.recv().await {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
}

/// Routes daemon frames into the handle's channels until EXIT or EOF.
/// Dropped stream receivers just discard their data; EXIT must still get
/// through.
async fn demux<R>(
    mut reader: R,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    exit_tx: oneshot::Sender<ExitStatus>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame_or_eof(&mut reader).await {
            Ok(Some(Frame::Stdout { data, .. })) => {
                let _ = stdout_tx.send(data).await;
            }
            Ok(Some(Frame::Stderr { data, .. })) => {
                let _ = stderr_tx.send(data).await;
            }
            Ok(Some(Frame::Exit { status, .. })) => {
                let _ = exit_tx.send(ExitStatus::from_wire(status));
                return;
            }
            Ok(Some(Frame::Pong)) => {}
            Ok(Some(other)) => {
                debug!(?other, "unexpected frame from daemon");
                return;
            }
            Ok(None) | Err(_) => return,
        }
    }
}
