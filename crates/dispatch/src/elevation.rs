//! Client-side elevation when no daemon is reachable.
//!
//! The ladder here is the tail of the strategy: a privileged host downgrades
//! (or switches) in-process; an unprivileged one rewrites the launch through
//! the preferred external helper.  When neither applies the request fails
//! with `ElevationUnavailable`; a request for a distinct identity is never
//! quietly run unelevated.

use forker_protocol::{CommandSpec, LaunchError};

use crate::direct;
use crate::process::Process;

#[cfg(unix)]
pub(crate) async fn launch_local(spec: &CommandSpec) -> Result<Process, LaunchError> {
    use forker_exec as exec;
    use forker_exec::helper;

    if exec::is_privileged() {
        // Covers the downgrade path too: a privileged host switching to an
        // unprivileged identity applies it after fork, before exec.
        let credentials = exec::identity::resolve(spec.requested_identity())?;
        return direct::launch_with(
            spec,
            spec.argv().to_vec(),
            Vec::new(),
            credentials,
            None,
        )
        .await;
    }

    let found = helper::find_helper().ok_or(LaunchError::ElevationUnavailable)?;
    tracing::debug!(helper = ?found.kind, "elevating through external helper");
    let invocation =
        helper::rewrite(&found, spec.requested_identity(), spec.argv(), true)?;
    direct::launch_with(spec, invocation.argv, invocation.env, None, invocation.askpass)
        .await
}

#[cfg(not(unix))]
pub(crate) async fn launch_local(spec: &CommandSpec) -> Result<Process, LaunchError> {
    use forker_protocol::Identity;

    // No helper integration exists here; ADMINISTRATOR has no mechanism and
    // anything more specific is not expressible at all.
    Err(match spec.requested_identity() {
        Identity::Administrator => LaunchError::ElevationUnavailable,
        _ => LaunchError::UnsupportedPlatform,
    })
}
