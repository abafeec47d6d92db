//! The client-side launch dispatcher.
//!
//! One entry point, [`Dispatcher::launch`], picks a backend from the
//! descriptor and the runtime's capabilities: pty collaborator for
//! `IoMode::Pty`, the daemon for elevation requests (or when forced), and
//! an in-process exec for everything else.  `DaemonUnreachable` is the one
//! recoverable error: the dispatcher falls back down the ladder instead of
//! surfacing it.

mod direct;
mod elevation;
mod probe;
mod process;
mod remote;
pub mod pty;
pub mod scope;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use forker_config::Settings;

pub use forker_protocol::{
    CommandSpec, ExitStatus, Identity, IoMode, LaunchError, PtyHints,
};
pub use process::{OutputStream, Process, ProcessStdin};
pub use pty::PtyBackend;
pub use scope::{Overlay, ScopeGuard};

pub struct Dispatcher {
    settings: Settings,
    cache: probe::NegativeCache,
    pty: Option<Arc<dyn PtyBackend>>,
}

impl Dispatcher {
    pub fn new(settings: Settings) -> Self {
        let ttl = Duration::from_millis(settings.client.probe_cache_ms);
        Self {
            settings,
            cache: probe::NegativeCache::new(ttl),
            pty: None,
        }
    }

    /// Registers the pty collaborator that `IoMode::Pty` launches delegate
    /// to.
    #[must_use]
    pub fn with_pty_backend(mut self, backend: Arc<dyn PtyBackend>) -> Self {
        self.pty = Some(backend);
        self
    }

    /// Launches a command, returning a handle to its streams and exit.
    ///
    /// Backend order: pty collaborator, then the daemon when the descriptor
    /// asks for elevation or forces daemon routing, then direct exec.  An
    /// unreachable daemon falls through to the local elevation ladder (or a
    /// plain exec when no elevation was requested).
    pub async fn launch(&self, spec: CommandSpec) -> Result<Process, LaunchError> {
        let spec = scope::apply(spec);
        spec.validate()?;

        if spec.mode() == IoMode::Pty {
            let backend = self.pty.clone().ok_or(LaunchError::PtyUnavailable)?;
            return backend.launch(&spec).await;
        }

        let wants_elevation = !spec.requested_identity().is_current();
        if wants_elevation || spec.daemon_preferred() {
            if self.cache.blocked() {
                debug!("daemon recently unreachable, skipping probe");
            } else {
                match remote::launch(&self.settings, &spec).await {
                    Ok(process) => {
                        self.cache.clear();
                        return Ok(process);
                    }
                    Err(err @ LaunchError::DaemonUnreachable(_)) => {
                        debug!(%err, "falling back past the daemon");
                        self.cache.record_failure();
                    }
                    Err(other) => return Err(other),
                }
            }
            if wants_elevation {
                return elevation::launch_local(&spec).await;
            }
        }

        direct::launch(&spec).await
    }

    /// Launches and waits, `system(3)`-style.  With `IoMode::System` the
    /// child shares the caller's stdio and this returns only at exit.
    pub async fn run(&self, spec: CommandSpec) -> Result<ExitStatus, LaunchError> {
        let mut process = self.launch(spec).await?;
        process.wait().await
    }

    /// Probes the daemon endpoint: connect plus HELLO within the configured
    /// timeout.  Failures populate the negative cache.
    pub async fn daemon_reachable(&self) -> bool {
        if self.cache.blocked() {
            return false;
        }
        let up = remote::probe(&self.settings).await;
        if up {
            self.cache.clear();
        } else {
            self.cache.record_failure();
        }
        up
    }
}
