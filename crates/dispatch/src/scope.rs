//! Thread-scoped launch defaults.
//!
//! An [`Overlay`] is a first-class value; entering it yields a guard whose
//! drop releases the scope on every exit path.  Nested scopes compose by
//! overwrite of set fields, innermost last.  The stack is thread-local, so
//! one thread's overlays are invisible to another; the dispatcher reads the
//! stack synchronously when a launch begins.

use std::cell::RefCell;
use std::collections::BTreeMap;

use forker_protocol::{CommandSpec, Identity, IoMode};

thread_local! {
    static STACK: RefCell<Vec<Overlay>> = const { RefCell::new(Vec::new()) };
}

/// Ambient defaults applied to every descriptor launched within the scope.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    pub identity: Option<Identity>,
    pub io_mode: Option<IoMode>,
    pub env: BTreeMap<String, String>,
    pub prefer_daemon: Option<bool>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn prefer_daemon(mut self, prefer: bool) -> Self {
        self.prefer_daemon = Some(prefer);
        self
    }

    /// Pushes this overlay onto the current thread's scope stack.
    #[must_use = "the scope ends when the guard drops"]
    pub fn enter(self) -> ScopeGuard {
        let depth = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(self);
            stack.len()
        });
        ScopeGuard { depth }
    }
}

/// Releases its overlay (and anything nested deeper) when dropped.
pub struct ScopeGuard {
    depth: usize,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.truncate(self.depth.saturating_sub(1));
        });
    }
}

/// Folds the active overlays into `spec`, outermost first so inner scopes
/// win.
pub(crate) fn apply(spec: CommandSpec) -> CommandSpec {
    let overlays = STACK.with(|stack| stack.borrow().clone());
    let mut spec = spec;
    for overlay in overlays {
        if let Some(identity) = overlay.identity {
            spec = spec.identity(identity);
        }
        if let Some(mode) = overlay.io_mode {
            spec = spec.io_mode(mode);
        }
        for (key, value) in overlay.env {
            spec = spec.env(key, value);
        }
        if let Some(prefer) = overlay.prefer_daemon {
            spec = spec.prefer_daemon(prefer);
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_overrides_descriptor_fields() {
        let _guard = Overlay::new()
            .identity(Identity::Uid(7))
            .io_mode(IoMode::Sink)
            .env("SCOPED", "yes")
            .enter();

        let spec = apply(CommandSpec::new("true").io_mode(IoMode::Input));
        assert_eq!(spec.mode(), IoMode::Sink);
        assert_eq!(spec.requested_identity(), &Identity::Uid(7));
        assert_eq!(spec.env_overlay().get("SCOPED").map(String::as_str), Some("yes"));
    }

    #[test]
    fn nested_scopes_overwrite_innermost_last() {
        let _outer = Overlay::new()
            .io_mode(IoMode::Sink)
            .env("A", "outer")
            .env("B", "outer")
            .enter();
        let _inner = Overlay::new().env("A", "inner").enter();

        let spec = apply(CommandSpec::new("true"));
        assert_eq!(spec.mode(), IoMode::Sink);
        assert_eq!(spec.env_overlay().get("A").map(String::as_str), Some("inner"));
        assert_eq!(spec.env_overlay().get("B").map(String::as_str), Some("outer"));
    }

    #[test]
    fn dropping_the_guard_releases_the_scope() {
        {
            let _guard = Overlay::new().io_mode(IoMode::Sink).enter();
            assert_eq!(apply(CommandSpec::new("true")).mode(), IoMode::Sink);
        }
        assert_eq!(apply(CommandSpec::new("true")).mode(), IoMode::Default);
    }

    #[test]
    fn dropping_an_outer_guard_releases_nested_scopes_too() {
        let outer = Overlay::new().env("A", "outer").enter();
        let _inner = Overlay::new().env("A", "inner").enter();
        drop(outer);
        let spec = apply(CommandSpec::new("true"));
        assert!(spec.env_overlay().get("A").is_none());
    }

    #[test]
    fn scopes_are_invisible_across_threads() {
        let _guard = Overlay::new().io_mode(IoMode::Sink).enter();
        let seen = std::thread::spawn(|| apply(CommandSpec::new("true")).mode())
            .join()
            .unwrap();
        assert_eq!(seen, IoMode::Default);
    }
}
