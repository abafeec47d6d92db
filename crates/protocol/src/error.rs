//! Error taxonomy shared by the daemon and the dispatcher.
//!
//! A child dying to a signal is not an error here: `wait()` returns an
//! [`ExitStatus`](crate::ExitStatus) whose `signal()` carries the number.

use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum LaunchError {
    /// Descriptor validation failed before any launch attempt.  Not retriable.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Endpoint absent, HELLO timed out, or the cookie was rejected.
    /// The dispatcher recovers by falling back to a direct exec when the
    /// requested identity allows it.
    #[error("daemon unreachable: {0}")]
    DaemonUnreachable(String),

    /// Malformed or oversized frame; the connection is closed and not retried.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// The child could not be started.  `errno` is surfaced verbatim.
    #[error("could not start {program}: {message} (errno {errno})")]
    ExecFailed {
        program: String,
        errno: i32,
        message: String,
    },

    /// The identity switch was refused by the operating system.
    #[error("identity switch refused by the operating system")]
    ElevationDenied,

    /// No mechanism to elevate exists in the current configuration.
    #[error("no elevation mechanism available")]
    ElevationUnavailable,

    /// A blocking wait was interrupted; callers choose whether to retry.
    #[error("wait interrupted")]
    Interrupted,

    /// Elevation to a distinct identity is not expressible on this platform.
    #[error("elevation not supported on this platform")]
    UnsupportedPlatform,

    /// `IoMode::Pty` was requested but no pty collaborator is registered.
    #[error("no pty backend registered")]
    PtyUnavailable,
}

impl LaunchError {
    pub fn exec_failed(program: &str, err: &std::io::Error) -> Self {
        Self::ExecFailed {
            program: program.to_string(),
            errno: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }

    /// Whether the dispatcher may retry this launch through another backend.
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::DaemonUnreachable(_))
    }
}
