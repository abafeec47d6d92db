//! Child construction on the daemon side of a LAUNCH.
//!
//! The daemon wires pipes for everything it must forward, applies the env
//! overlay on top of its own environment, and switches identity between fork
//! and exec.  When the daemon itself is unprivileged the identity request is
//! rewritten through an external helper instead, non-interactively.

use std::process::Stdio;

use tokio::process::{Child, Command};

use forker_exec::helper::{self, TempPath};
use forker_exec::path::resolve_executable;
use forker_exec::{self as exec, ChildSetup};
use forker_protocol::{CommandSpec, IoMode, LaunchError};

// Spelled out rather than pulled from libc so this file compiles on
// platforms where the daemon only ever refuses to elevate.
const ENOENT: i32 = 2;
const EPERM: i32 = 1;

#[derive(Debug)]
pub(crate) struct LaunchedChild {
    pub child: Child,
    pub pid: u32,
    /// Keeps a helper askpass script alive until the child is reaped.
    pub _askpass: Option<TempPath>,
}

pub(crate) fn launch_child(spec: &CommandSpec) -> Result<LaunchedChild, LaunchError> {
    spec.validate()?;
    if spec.mode() == IoMode::Pty {
        // The pty backend is a dispatcher-side collaborator; a LAUNCH should
        // never reach the daemon with this mode.
        return Err(LaunchError::PtyUnavailable);
    }

    let identity = spec.requested_identity();
    let (argv, extra_env, askpass, credentials) = if identity.is_current() {
        (spec.argv().to_vec(), Vec::new(), None, None)
    } else if exec::is_privileged() {
        let creds = exec::identity::resolve(identity)?;
        (spec.argv().to_vec(), Vec::new(), None, creds)
    } else {
        let found = helper::find_helper().ok_or(LaunchError::ElevationUnavailable)?;
        let invocation = helper::rewrite(&found, identity, spec.argv(), false)?;
        (invocation.argv, invocation.env, invocation.askpass, None)
    };

    let path_override = spec.env_overlay().get("PATH").map(String::as_str);
    let program = resolve_executable(&argv[0], path_override).ok_or_else(|| {
        LaunchError::ExecFailed {
            program: argv[0].clone(),
            errno: ENOENT,
            message: "no such executable".to_string(),
        }
    })?;

    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    cmd.envs(spec.env_overlay());
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    if let Some(dir) = spec.working_dir() {
        cmd.current_dir(dir);
    }
    apply_stdio(&mut cmd, spec.mode(), spec.stderr_merged());
    exec::configure(
        &mut cmd,
        ChildSetup {
            new_process_group: true,
            merge_stderr: spec.stderr_merged(),
            switch_to: credentials,
        },
    );

    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id().unwrap_or_default();
            tracing::debug!(pid, argv0 = %argv[0], "child spawned");
            Ok(LaunchedChild {
                child,
                pid,
                _askpass: askpass,
            })
        }
        Err(err) => {
            // A refused identity switch surfaces from the pre_exec hook as
            // the spawn error.
            if credentials.is_some() && err.raw_os_error() == Some(EPERM) {
                Err(LaunchError::ElevationDenied)
            } else {
                Err(LaunchError::exec_failed(&argv[0], &err))
            }
        }
    }
}

/// Daemon-side stdio table: pipe what gets forwarded, discard the rest.
/// With stderr merged, fd 2 is re-pointed at the stdout pipe in `pre_exec`,
/// so its own slot is closed here.
fn apply_stdio(cmd: &mut Command, mode: IoMode, merged: bool) {
    let stderr = || {
        if merged {
            Stdio::null()
        } else {
            Stdio::piped()
        }
    };
    match mode {
        IoMode::Default | IoMode::Io => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(stderr());
        }
        IoMode::Input => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(stderr());
        }
        IoMode::Output => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        IoMode::Sink | IoMode::System => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        IoMode::Pty => unreachable!("rejected before stdio wiring"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use forker_protocol::Identity;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn input_mode_pipes_stdout() {
        let spec = CommandSpec::new("echo")
            .arg("hello")
            .io_mode(IoMode::Input);
        let mut launched = launch_child(&spec).unwrap();
        let mut stdout = launched.child.stdout.take().unwrap();
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\n");
        assert!(launched.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn merged_stderr_lands_on_the_stdout_pipe() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2")
            .io_mode(IoMode::Input)
            .merge_stderr(true);
        let mut launched = launch_child(&spec).unwrap();
        assert!(launched.child.stderr.is_none());
        let mut stdout = launched.child.stdout.take().unwrap();
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.unwrap();
        assert!(buf.contains("out"));
        assert!(buf.contains("err"));
        launched.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_exec_failed() {
        let spec = CommandSpec::new("forker-no-such-program");
        let err = launch_child(&spec).unwrap_err();
        assert!(matches!(err, LaunchError::ExecFailed { errno: 2, .. }));
    }

    #[tokio::test]
    async fn pty_mode_is_refused() {
        let spec = CommandSpec::new("true").io_mode(IoMode::Pty);
        assert!(matches!(
            launch_child(&spec).unwrap_err(),
            LaunchError::PtyUnavailable
        ));
    }

    #[tokio::test]
    async fn env_overlay_reaches_the_child() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("printf %s \"$FORKER_MARK\"")
            .env("FORKER_MARK", "42")
            .io_mode(IoMode::Input);
        let mut launched = launch_child(&spec).unwrap();
        let mut stdout = launched.child.stdout.take().unwrap();
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "42");
        launched.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn privileged_daemon_resolves_identities_directly() {
        if !exec::is_privileged() {
            return;
        }
        // Running as root: a uid request switches in-process, no helper.
        let spec = CommandSpec::new("id")
            .arg("-u")
            .io_mode(IoMode::Input)
            .identity(Identity::Uid(0));
        let mut launched = launch_child(&spec).unwrap();
        let mut stdout = launched.child.stdout.take().unwrap();
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf.trim(), "0");
        assert!(launched.child.wait().await.unwrap().success());
    }
}
