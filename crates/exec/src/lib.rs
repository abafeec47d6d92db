//! OS-level process mechanics shared by the daemon and the dispatcher.
//!
//! This crate owns everything that happens between `fork` and `exec`:
//! starting a new process group, folding stderr into stdout, and switching
//! the child to a requested identity.  Policy (which identity, which
//! backend, whether a helper is involved) lives with the callers.

pub mod helper;
pub mod identity;
pub mod path;

use std::io;

pub use identity::Credentials;

/// Child configuration applied inside a `pre_exec` hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildSetup {
    /// Start a new process group so signals scope to the child tree.
    pub new_process_group: bool,
    /// Duplicate stdout onto stderr so both streams interleave on one pipe.
    pub merge_stderr: bool,
    /// Switch to these credentials after fork and before exec.
    pub switch_to: Option<Credentials>,
}

/// Installs the `pre_exec` hook realizing `setup` on `cmd`.
///
/// A failing identity switch aborts the child before exec; the parent sees
/// the errno as the spawn error (EPERM for a refused switch).
pub fn configure(cmd: &mut tokio::process::Command, setup: ChildSetup) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;

        // SAFETY: the closure runs between fork and exec and performs only
        // async-signal-safe syscalls (setpgid, dup2, setgroups, setgid,
        // setuid).
        unsafe {
            cmd.as_std_mut().pre_exec(move || {
                if setup.new_process_group {
                    // SAFETY: setpgid on self is async-signal-safe.
                    if unsafe { libc::setpgid(0, 0) } != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if setup.merge_stderr {
                    // SAFETY: dup2 over the already-wired stdio descriptors.
                    if unsafe { libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) } < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if let Some(creds) = setup.switch_to {
                    // Order matters: groups, then gid, then uid; once uid
                    // drops, the others are no longer permitted.
                    // SAFETY: plain setgroups/setgid/setuid syscalls.
                    unsafe {
                        if libc::setgroups(0, std::ptr::null()) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                        if libc::setgid(creds.gid) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                        if libc::setuid(creds.uid) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (cmd, setup);
    }
}

/// Delivers `signal` to the process group led by `pid`.
///
/// A vanished group reports success so kill stays idempotent after exit.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) with a negative pid targets the process group.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-group signals are unavailable on this platform",
    ))
}

/// Delivers `signal` to a single process, idempotently after exit.
#[cfg(unix)]
pub fn signal_process(pid: u32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) with a positive pid targets one process.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
pub fn signal_process(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are unavailable on this platform",
    ))
}

/// Whether `pid` still names a live process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 probes liveness without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Effective uid of the current process.
#[cfg(unix)]
pub fn current_euid() -> u32 {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
pub fn current_euid() -> u32 {
    u32::MAX
}

/// Whether this process may switch identities directly (uid 0 on POSIX).
pub fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        current_euid() == 0
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn merge_stderr_interleaves_on_stdout() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg("echo out; echo err 1>&2")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        configure(
            &mut cmd,
            ChildSetup {
                merge_stderr: true,
                ..ChildSetup::default()
            },
        );
        let output = cmd.output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("out"));
        assert!(stdout.contains("err"));
    }

    #[tokio::test]
    async fn process_group_separates_child_from_launcher() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("5")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        configure(
            &mut cmd,
            ChildSetup {
                new_process_group: true,
                ..ChildSetup::default()
            },
        );
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap() as libc::pid_t;
        // SAFETY: getpgid/getpgrp are plain queries.
        let child_pgid = unsafe { libc::getpgid(pid) };
        let own_pgid = unsafe { libc::getpgrp() };
        assert_eq!(child_pgid, pid);
        assert_ne!(child_pgid, own_pgid);

        signal_group(pid as u32, libc::SIGKILL).unwrap();
        let _ = child.wait().await;
    }

    #[test]
    fn signal_group_is_idempotent_for_vanished_pids() {
        // Huge pid that cannot exist; ESRCH must read as success.
        assert!(signal_group(0x3FFF_FFF0, libc::SIGTERM).is_ok());
    }
}
