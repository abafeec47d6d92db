//! Daemon startup and the accept loop.
//!
//! Startup order matters: probe the endpoint for a live daemon first (a
//! HELLO answered with HELLO_OK means someone is already serving), then
//! persist a fresh cookie, then bind.  Each accepted connection becomes an
//! independent session task; a failing session never takes the daemon down.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{info, warn};

use forker_config::{Endpoint, Settings};
use forker_protocol::{Cookie, Frame, cookie, read_frame, write_frame};

use crate::session::{SessionContext, handle_session};

#[derive(Debug)]
enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

#[derive(Debug)]
pub struct Daemon {
    settings: Settings,
    cookie: Cookie,
    listener: Listener,
    local: Endpoint,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    /// Generates and persists the cookie, then binds the endpoint.
    /// Fails if a live daemon already answers a HELLO there.
    pub async fn bind(settings: Settings) -> Result<Self> {
        let state_dir = settings.state_dir();
        let endpoint = settings.endpoint();
        let probe_timeout = Duration::from_millis(settings.client.probe_timeout_ms);

        if let Ok(existing) = cookie::load(&state_dir) {
            if hello_probe(&endpoint, &existing, probe_timeout).await {
                bail!("another daemon is already serving {endpoint}");
            }
        }

        let cookie = cookie::persist(&state_dir)
            .with_context(|| format!("writing cookie under {}", state_dir.display()))?;

        let (listener, local) = match &endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(*addr)
                    .await
                    .with_context(|| format!("binding {addr}"))?;
                let local = Endpoint::Tcp(listener.local_addr()?);
                (Listener::Tcp(listener), local)
            }
            Endpoint::Unix(path) => {
                #[cfg(unix)]
                {
                    // The probe above established nobody is serving here, so
                    // any leftover socket file is stale.
                    if path.exists() {
                        let _ = std::fs::remove_file(path);
                    }
                    let listener = UnixListener::bind(path)
                        .with_context(|| format!("binding {}", path.display()))?;
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                    (Listener::Unix(listener), Endpoint::Unix(path.clone()))
                }
                #[cfg(not(unix))]
                bail!("filesystem socket endpoints are unavailable on this platform");
            }
        };

        let (shutdown_tx, _) = watch::channel(false);
        info!(endpoint = %local, "daemon listening");
        Ok(Self {
            settings,
            cookie,
            listener,
            local,
            shutdown_tx,
        })
    }

    /// The endpoint actually bound (port 0 requests resolve here).
    pub fn endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Flipping this to `true` stops the accept loop.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub async fn serve(self) -> Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let grace = Duration::from_millis(self.settings.daemon.grace_ms);
        let stdin_queue = self.settings.daemon.stdin_queue;
        match self.listener {
            Listener::Tcp(listener) => {
                serve_tcp(listener, self.cookie, grace, stdin_queue, shutdown_rx).await
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                serve_unix(listener, self.cookie, grace, stdin_queue, shutdown_rx).await
            }
        }
    }
}

/// Binds per `settings` and serves until ctrl-c.
pub async fn run(settings: Settings) -> Result<()> {
    let daemon = Daemon::bind(settings).await?;
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(true);
        }
    });
    daemon.serve().await
}

async fn serve_tcp(
    listener: TcpListener,
    cookie: Cookie,
    grace: Duration,
    stdin_queue: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let ctx = SessionContext {
                        cookie: cookie.clone(),
                        grace,
                        stdin_queue,
                        peer: peer.to_string(),
                    };
                    tokio::spawn(handle_session(stream, ctx));
                }
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn serve_unix(
    listener: UnixListener,
    cookie: Cookie,
    grace: Duration,
    stdin_queue: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = SessionContext {
                        cookie: cookie.clone(),
                        grace,
                        stdin_queue,
                        peer: "unix".to_string(),
                    };
                    tokio::spawn(handle_session(stream, ctx));
                }
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }
    Ok(())
}

/// Whether a live daemon answers a HELLO with `cookie` at `endpoint`.
async fn hello_probe(endpoint: &Endpoint, cookie: &Cookie, probe_timeout: Duration) -> bool {
    let attempt = async {
        match endpoint {
            Endpoint::Tcp(addr) => match TcpStream::connect(*addr).await {
                Ok(stream) => probe_stream(stream, cookie).await,
                Err(_) => false,
            },
            Endpoint::Unix(path) => {
                #[cfg(unix)]
                {
                    match UnixStream::connect(path).await {
                        Ok(stream) => probe_stream(stream, cookie).await,
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
    tokio::time::timeout(probe_timeout, attempt)
        .await
        .unwrap_or(false)
}

async fn probe_stream<S>(mut stream: S, cookie: &Cookie) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Frame::Hello {
        cookie: cookie.bytes().to_vec(),
    };
    if write_frame(&mut stream, &hello).await.is_err() {
        return false;
    }
    matches!(read_frame(&mut stream).await, Ok(Frame::HelloOk))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use forker_protocol::{CommandSpec, IoMode};
    use tempfile::TempDir;

    /// Daemon on an ephemeral loopback port with a scratch state dir and a
    /// short grace so teardown tests stay fast.
    async fn start_daemon() -> (TempDir, Endpoint, watch::Sender<bool>) {
        let state = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.state_dir = state.path().to_string_lossy().into_owned();
        settings.endpoint.port = 0;
        settings.daemon.grace_ms = 400;

        let daemon = Daemon::bind(settings).await.unwrap();
        let endpoint = daemon.endpoint().clone();
        let shutdown = daemon.shutdown_handle();
        tokio::spawn(daemon.serve());
        (state, endpoint, shutdown)
    }

    async fn connect(endpoint: &Endpoint) -> TcpStream {
        match endpoint {
            Endpoint::Tcp(addr) => TcpStream::connect(*addr).await.unwrap(),
            Endpoint::Unix(_) => unreachable!("tests use TCP"),
        }
    }

    async fn authenticated(state: &TempDir, endpoint: &Endpoint) -> TcpStream {
        let cookie = cookie::load(state.path()).unwrap();
        let mut stream = connect(endpoint).await;
        write_frame(
            &mut stream,
            &Frame::Hello {
                cookie: cookie.bytes().to_vec(),
            },
        )
        .await
        .unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Frame::HelloOk);
        stream
    }

    /// Reads frames for `child_id` until EXIT, returning (stdout, stderr,
    /// status).
    async fn collect_child(
        stream: &mut TcpStream,
        child_id: u32,
    ) -> (Vec<u8>, Vec<u8>, i32) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            match read_frame(stream).await.unwrap() {
                Frame::Stdout { child_id: id, data } if id == child_id => {
                    stdout.extend_from_slice(&data);
                }
                Frame::Stderr { child_id: id, data } if id == child_id => {
                    stderr.extend_from_slice(&data);
                }
                Frame::Exit { child_id: id, status } if id == child_id => {
                    return (stdout, stderr, status);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn launch_echo_streams_stdout_and_exit() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let spec = CommandSpec::new("echo").arg("hello").io_mode(IoMode::Input);
        write_frame(&mut stream, &Frame::Launch { child_id: 1, spec })
            .await
            .unwrap();

        let Frame::Launched { child_id: 1, pid } = read_frame(&mut stream).await.unwrap()
        else {
            panic!("expected LAUNCHED");
        };
        assert!(pid > 0);

        let (stdout, stderr, status) = collect_child(&mut stream, 1).await;
        assert_eq!(stdout, b"hello\n");
        assert!(stderr.is_empty());
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn wrong_cookie_is_rejected_before_any_launch() {
        let (_state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = connect(&endpoint).await;

        write_frame(
            &mut stream,
            &Frame::Hello {
                cookie: vec![0xDE, 0xAD, 0xBE, 0xEF],
            },
        )
        .await
        .unwrap();

        match read_frame(&mut stream).await.unwrap() {
            Frame::HelloReject { .. } => {}
            other => panic!("expected HELLO_REJECT, got {other:?}"),
        }
        // The daemon drops the connection; no LAUNCH can follow.
        assert!(
            forker_protocol::read_frame_or_eof(&mut stream)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn stdin_round_trips_through_cat() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let spec = CommandSpec::new("cat").io_mode(IoMode::Io);
        write_frame(&mut stream, &Frame::Launch { child_id: 5, spec })
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut stream).await.unwrap(),
            Frame::Launched { child_id: 5, .. }
        ));

        write_frame(
            &mut stream,
            &Frame::Stdin {
                child_id: 5,
                data: b"ping".to_vec(),
            },
        )
        .await
        .unwrap();
        write_frame(&mut stream, &Frame::StdinClose { child_id: 5 })
            .await
            .unwrap();

        let (stdout, _, status) = collect_child(&mut stream, 5).await;
        assert_eq!(stdout, b"ping");
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn merged_stderr_produces_no_stderr_frames() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2")
            .io_mode(IoMode::Input)
            .merge_stderr(true);
        write_frame(&mut stream, &Frame::Launch { child_id: 2, spec })
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut stream).await.unwrap(),
            Frame::Launched { child_id: 2, .. }
        ));

        let (stdout, stderr, status) = collect_child(&mut stream, 2).await;
        let text = String::from_utf8_lossy(&stdout);
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(stderr.is_empty());
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn concurrent_children_multiplex_on_one_session() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let slow = CommandSpec::new("sh")
            .arg("-c")
            .arg("sleep 0.2; echo slow")
            .io_mode(IoMode::Input);
        let fast = CommandSpec::new("echo").arg("fast").io_mode(IoMode::Input);
        write_frame(&mut stream, &Frame::Launch { child_id: 10, spec: slow })
            .await
            .unwrap();
        write_frame(&mut stream, &Frame::Launch { child_id: 11, spec: fast })
            .await
            .unwrap();

        let mut outputs: std::collections::HashMap<u32, Vec<u8>> =
            std::collections::HashMap::new();
        let mut exits = 0;
        let mut launches = 0;
        while exits < 2 {
            match read_frame(&mut stream).await.unwrap() {
                Frame::Launched { .. } => launches += 1,
                Frame::Stdout { child_id, data } => {
                    outputs.entry(child_id).or_default().extend_from_slice(&data);
                }
                Frame::Exit { status, .. } => {
                    assert_eq!(status, 0);
                    exits += 1;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(launches, 2);
        assert_eq!(outputs.remove(&10).unwrap(), b"slow\n");
        assert_eq!(outputs.remove(&11).unwrap(), b"fast\n");
    }

    #[tokio::test]
    async fn failed_launch_keeps_the_session_usable() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let bad = CommandSpec::new("forker-no-such-program").io_mode(IoMode::Sink);
        write_frame(&mut stream, &Frame::Launch { child_id: 1, spec: bad })
            .await
            .unwrap();
        match read_frame(&mut stream).await.unwrap() {
            Frame::Failed { child_id: 1, errno, .. } => assert_eq!(errno, 2),
            other => panic!("expected FAILED, got {other:?}"),
        }

        // Session stays READY.
        let good = CommandSpec::new("true").io_mode(IoMode::Sink);
        write_frame(&mut stream, &Frame::Launch { child_id: 2, spec: good })
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut stream).await.unwrap(),
            Frame::Launched { child_id: 2, .. }
        ));
    }

    #[tokio::test]
    async fn dropped_connection_reaps_children_within_grace() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let spec = CommandSpec::new("sleep").arg("60").io_mode(IoMode::Sink);
        write_frame(&mut stream, &Frame::Launch { child_id: 1, spec })
            .await
            .unwrap();
        let Frame::Launched { pid, .. } = read_frame(&mut stream).await.unwrap() else {
            panic!("expected LAUNCHED");
        };
        assert!(forker_exec::process_alive(pid));

        drop(stream);

        // SIGTERM immediately, SIGKILL after 400 ms; allow a little slack.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while forker_exec::process_alive(pid) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "child {pid} survived connection teardown"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn kill_frame_signals_the_child() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;

        let spec = CommandSpec::new("sleep").arg("60").io_mode(IoMode::Sink);
        write_frame(&mut stream, &Frame::Launch { child_id: 3, spec })
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut stream).await.unwrap(),
            Frame::Launched { child_id: 3, .. }
        ));

        write_frame(&mut stream, &Frame::Kill { child_id: 3, signal: 15 })
            .await
            .unwrap();
        match read_frame(&mut stream).await.unwrap() {
            Frame::Exit { child_id: 3, status } => assert_eq!(status, -15),
            other => panic!("expected EXIT, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_gets_pong_in_ready_state() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let mut stream = authenticated(&state, &endpoint).await;
        write_frame(&mut stream, &Frame::Ping).await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn second_daemon_on_a_live_endpoint_is_refused() {
        let (state, endpoint, _shutdown) = start_daemon().await;
        let Endpoint::Tcp(addr) = endpoint else {
            panic!("tests use TCP")
        };

        let mut settings = Settings::default();
        settings.state_dir = state.path().to_string_lossy().into_owned();
        settings.endpoint.port = addr.port();
        let err = Daemon::bind(settings).await.unwrap_err();
        assert!(err.to_string().contains("already serving"));
    }
}
