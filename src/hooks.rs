//! Lifecycle hooks for the supervisor and its workers.
//!
//! [`Hooks`] is a capability trait with no-op defaults: implement only
//! the moments you care about. `on_start`/`on_reload` run inside worker
//! processes; `on_child_start`/`on_child_exit` run in the parent. A
//! worker keeps the hooks it was forked with — hooks never travel over
//! the control channel.
//!
//! Hook code must not be able to take down the supervision loop, so
//! every invocation goes through [`guarded`], which catches panics and
//! logs them.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::config::Options;

/// Shared handle to a hooks implementation.
pub type HooksRef = Arc<dyn Hooks>;

/// How a reaped worker process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal termination with the given exit code.
    Code(i32),
    /// Termination by the given signal number.
    Signal(i32),
}

impl ExitStatus {
    /// The exit code, when the process terminated normally.
    pub fn code(self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(code),
            ExitStatus::Signal(_) => None,
        }
    }

    /// True for a clean zero exit.
    pub fn success(self) -> bool {
        self == ExitStatus::Code(0)
    }
}

/// Lifecycle observation points.
pub trait Hooks: Send + Sync + 'static {
    /// Runs in the child immediately after fork, before the worker
    /// runtime starts.
    fn on_start(&self) {}

    /// Runs in the child with the new options after each reload.
    fn on_reload(&self, _options: &Options) {}

    /// Runs in the parent with the pid of a freshly spawned worker.
    fn on_child_start(&self, _pid: i32) {}

    /// Runs in the parent after a worker has been reaped.
    fn on_child_exit(&self, _pid: i32, _status: ExitStatus) {}
}

/// The default: observe nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Invokes a hook, catching and logging a panic instead of unwinding
/// into the supervision loop.
pub(crate) fn guarded<F: FnOnce()>(hook: &'static str, f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!(hook, panic = panic_message(&payload), "lifecycle hook panicked");
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_swallows_panics() {
        guarded("test", || panic!("boom"));
        guarded("test", || panic!("{}", String::from("formatted boom")));
    }

    #[test]
    fn exit_status_accessors() {
        assert_eq!(ExitStatus::Code(0).code(), Some(0));
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Code(3).success());
        assert_eq!(ExitStatus::Signal(15).code(), None);
    }

    #[test]
    fn default_hooks_are_no_ops() {
        let hooks: HooksRef = Arc::new(NoHooks);
        hooks.on_start();
        hooks.on_reload(&Options::default());
        hooks.on_child_start(42);
        hooks.on_child_exit(42, ExitStatus::Code(0));
    }
}
