//! In-process exec backend.
//!
//! With `identity = CURRENT` and no daemon involved, a launch through here
//! is observationally a plain fork/exec with the same argv, env, and cwd:
//! no process-group games, no wrapping, caller-side stdio wiring only.

use std::process::Stdio;

use tokio::process::Command;

use forker_exec::helper::TempPath;
use forker_exec::path::resolve_executable;
use forker_exec::{self as exec, ChildSetup, Credentials};
use forker_protocol::{CommandSpec, IoMode, LaunchError};

use crate::process::Process;

const ENOENT: i32 = 2;
const EPERM: i32 = 1;

pub(crate) async fn launch(spec: &CommandSpec) -> Result<Process, LaunchError> {
    launch_with(spec, spec.argv().to_vec(), Vec::new(), None, None).await
}

/// Launches `argv` (possibly a helper rewrite of the descriptor's argv)
/// with the descriptor's stdio contract.
pub(crate) async fn launch_with(
    spec: &CommandSpec,
    argv: Vec<String>,
    extra_env: Vec<(String, String)>,
    switch_to: Option<Credentials>,
    askpass: Option<TempPath>,
) -> Result<Process, LaunchError> {
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
            new_process_group: false,
            merge_stderr: spec.stderr_merged(),
            switch_to,
        },
    );

    match cmd.spawn() {
        Ok(child) => Ok(Process::from_local(child, argv[0].clone(), askpass)),
        Err(err) => {
            if switch_to.is_some() && err.raw_os_error() == Some(EPERM) {
                Err(LaunchError::ElevationDenied)
            } else {
                Err(LaunchError::exec_failed(&argv[0], &err))
            }
        }
    }
}

/// Caller-side stdio table from the dispatch decision matrix.
fn apply_stdio(cmd: &mut Command, mode: IoMode, merged: bool) {
    let captured_err = || {
        if merged {
            Stdio::null()
        } else {
            Stdio::piped()
        }
    };
    match mode {
        IoMode::Default | IoMode::System => {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        IoMode::Input => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(captured_err());
        }
        IoMode::Output => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        IoMode::Io => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(captured_err());
        }
        IoMode::Sink => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        IoMode::Pty => unreachable!("pty launches never reach the direct backend"),
    }
}
