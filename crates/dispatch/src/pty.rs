//! Seam for the pseudo-terminal collaborator.
//!
//! The core does not ship a pty implementation; a host that wants
//! `IoMode::Pty` registers a backend here and the dispatcher delegates
//! the whole launch to it, pty hints included.

use forker_protocol::{CommandSpec, LaunchError};

use crate::process::Process;

#[async_trait::async_trait]
pub trait PtyBackend: Send + Sync {
    /// Launches `spec` on a pty master pair instead of pipe stdio.
    async fn launch(&self, spec: &CommandSpec) -> Result<Process, LaunchError>;
}
