//! The launch descriptor: what to run, as whom, and how stdio is wired.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;
use crate::wire::{self, Payload, WireError};

/// Stdio wiring contract for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Inherited stdio; the child shares the launcher's terminal.
    #[default]
    Default,
    /// Caller consumes the child's stdout; the child gets no stdin.
    Input,
    /// Caller feeds the child's stdin; stdout is not captured.
    Output,
    /// Full bidirectional pipes.
    Io,
    /// Stdout and stderr discarded at the source.
    Sink,
    /// Pseudo-terminal; delegated to the pty collaborator.
    Pty,
    /// Synchronous blocking exec, no captured streams.
    System,
}

impl IoMode {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            IoMode::Default => 0,
            IoMode::Input => 1,
            IoMode::Output => 2,
            IoMode::Io => 3,
            IoMode::Sink => 4,
            IoMode::Pty => 5,
            IoMode::System => 6,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Result<Self, WireError> {
        Ok(match raw {
            0 => IoMode::Default,
            1 => IoMode::Input,
            2 => IoMode::Output,
            3 => IoMode::Io,
            4 => IoMode::Sink,
            5 => IoMode::Pty,
            6 => IoMode::System,
            _ => return Err(WireError::BadValue("io_mode")),
        })
    }
}

/// Effective identity requested for the child process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    /// Run as whoever the launching process already is.
    #[default]
    Current,
    /// Run as uid 0 (or the platform's administrative principal).
    Administrator,
    Uid(u32),
    Username(String),
    /// Elevate through sudo with a caller-supplied password fed via askpass.
    FixedPasswordSudo(String),
}

impl Identity {
    pub fn is_current(&self) -> bool {
        matches!(self, Identity::Current)
    }

    fn to_wire(&self) -> (u8, Option<String>) {
        match self {
            Identity::Current => (0, None),
            Identity::Administrator => (1, None),
            Identity::Uid(uid) => (2, Some(uid.to_string())),
            Identity::Username(name) => (3, Some(name.clone())),
            Identity::FixedPasswordSudo(pw) => (4, Some(pw.clone())),
        }
    }

    fn from_wire(kind: u8, arg: Option<String>) -> Result<Self, WireError> {
        Ok(match (kind, arg) {
            (0, None) => Identity::Current,
            (1, None) => Identity::Administrator,
            (2, Some(raw)) => {
                let uid = raw.parse().map_err(|_| WireError::BadValue("uid"))?;
                Identity::Uid(uid)
            }
            (3, Some(name)) => Identity::Username(name),
            (4, Some(pw)) => Identity::FixedPasswordSudo(pw),
            _ => return Err(WireError::BadValue("identity")),
        })
    }
}

/// Terminal geometry hints, meaningful only with [`IoMode::Pty`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyHints {
    pub rows: u16,
    pub cols: u16,
    pub term: Option<String>,
}

impl Default for PtyHints {
    fn default() -> Self {
        Self { rows: 24, cols: 80, term: None }
    }
}

/// Immutable description of a command to launch.
///
/// Built with chained setters, then handed to a launch backend; backends call
/// [`CommandSpec::validate`] before doing anything with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    io_mode: IoMode,
    identity: Identity,
    redirect_err_to_out: bool,
    pty_hints: Option<PtyHints>,
    prefer_daemon: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            cwd: None,
            env: BTreeMap::new(),
            io_mode: IoMode::default(),
            identity: Identity::default(),
            redirect_err_to_out: false,
            pty_hints: None,
            prefer_daemon: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = mode;
        self
    }

    #[must_use]
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Folds the child's stderr into its stdout stream.
    #[must_use]
    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.redirect_err_to_out = merge;
        self
    }

    #[must_use]
    pub fn pty_hints(mut self, hints: PtyHints) -> Self {
        self.pty_hints = Some(hints);
        self
    }

    /// Routes through the daemon even when a direct exec would suffice.
    /// Client-side only; never serialized.
    #[must_use]
    pub fn prefer_daemon(mut self, prefer: bool) -> Self {
        self.prefer_daemon = prefer;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env_overlay(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn mode(&self) -> IoMode {
        self.io_mode
    }

    pub fn requested_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn stderr_merged(&self) -> bool {
        self.redirect_err_to_out
    }

    pub fn pty(&self) -> Option<&PtyHints> {
        self.pty_hints.as_ref()
    }

    pub fn daemon_preferred(&self) -> bool {
        self.prefer_daemon
    }

    /// Checks the invariants every backend relies on.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(LaunchError::InvalidDescriptor(
                "argv must name an executable".into(),
            ));
        }
        for name in self.env.keys() {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(LaunchError::InvalidDescriptor(format!(
                    "environment name {name:?} is not settable"
                )));
            }
        }
        for value in self.env.values() {
            if value.contains('\0') {
                return Err(LaunchError::InvalidDescriptor(
                    "environment value contains NUL".into(),
                ));
            }
        }
        if let Identity::FixedPasswordSudo(password) = &self.identity {
            if password.is_empty() {
                return Err(LaunchError::InvalidDescriptor(
                    "fixed-password identity without a password".into(),
                ));
            }
        }
        Ok(())
    }

    // ── LAUNCH payload (wire form; `prefer_daemon` stays client-side) ────────

    pub(crate) fn encode_payload(&self, out: &mut Vec<u8>) {
        wire::put_string_list(out, &self.argv);
        wire::put_opt_string(out, self.cwd.as_ref().and_then(|p| p.to_str()));
        wire::put_string_map(out, &self.env);
        wire::put_u8(out, self.io_mode.to_wire());
        let (identity_kind, identity_arg) = self.identity.to_wire();
        wire::put_u8(out, identity_kind);
        wire::put_opt_string(out, identity_arg.as_deref());
        wire::put_u8(out, self.redirect_err_to_out as u8);
        let hints = self.pty_hints.clone().unwrap_or_default();
        wire::put_u16(out, hints.rows);
        wire::put_u16(out, hints.cols);
        wire::put_opt_string(out, hints.term.as_deref());
    }

    pub(crate) fn decode_payload(p: &mut Payload<'_>) -> Result<Self, WireError> {
        let argv = p.string_list()?;
        let cwd = p.opt_string()?.map(PathBuf::from);
        let env = p.string_map()?;
        let io_mode = IoMode::from_wire(p.u8()?)?;
        let identity_kind = p.u8()?;
        let identity_arg = p.opt_string()?;
        let identity = Identity::from_wire(identity_kind, identity_arg)?;
        let redirect_err_to_out = match p.u8()? {
            0 => false,
            1 => true,
            _ => return Err(WireError::BadValue("redir_err")),
        };
        let rows = p.u16()?;
        let cols = p.u16()?;
        let term = p.opt_string()?;
        let pty_hints = if io_mode == IoMode::Pty {
            Some(PtyHints { rows, cols, term })
        } else {
            None
        };
        Ok(Self {
            argv,
            cwd,
            env,
            io_mode,
            identity,
            redirect_err_to_out,
            pty_hints,
            prefer_daemon: false,
        })
    }
}

/// How a child ended: a normal exit code or a terminating signal.
///
/// Wire form is a single `i32`: non-negative = exit code, negative = the
/// negated signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(i32);

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self(code.max(0))
    }

    pub fn from_signal(signal: i32) -> Self {
        Self(-signal.abs())
    }

    pub fn from_wire(raw: i32) -> Self {
        Self(raw)
    }

    pub fn to_wire(self) -> i32 {
        self.0
    }

    pub fn success(self) -> bool {
        self.0 == 0
    }

    pub fn code(self) -> Option<i32> {
        (self.0 >= 0).then_some(self.0)
    }

    pub fn signal(self) -> Option<i32> {
        (self.0 < 0).then_some(-self.0)
    }

    pub fn from_std(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::from_signal(signal);
            }
        }
        Self::from_code(status.code().unwrap_or(1))
    }
}
