//! # Error types used by the supervisor and connection handlers.
//!
//! This module defines two main error enums:
//!
//! - [`SupervisorError`] errors raised by the parent supervisor itself.
//! - [`HandlerError`] errors raised by per-connection handler code.
//!
//! Both types provide `as_label` helpers returning short stable labels
//! for logs. Pipe-level peer-gone failures never appear here: writers
//! swallow them and readers report them as an end-of-stream sentinel,
//! which triggers worker-entry cleanup rather than error propagation.

use std::io;

use thiserror::Error;

/// # Errors produced by the parent supervisor.
///
/// Only bind-time failures surface to callers; everything that happens
/// inside the running supervision loop is logged and recovered from.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Binding a listening socket failed after the retry budget.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The `host:port` the bind was for.
        addr: String,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Construction was given an empty listener set.
    #[error("at least one listener is required")]
    NoListeners,

    /// Forking a worker process failed.
    #[error("fork failed: {errno}")]
    Fork {
        /// The errno reported by the kernel.
        errno: nix::errno::Errno,
    },

    /// Any other I/O failure (pipe creation, fd flag changes).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::Bind { .. } => "supervisor_bind",
            SupervisorError::NoListeners => "supervisor_no_listeners",
            SupervisorError::Fork { .. } => "supervisor_fork",
            SupervisorError::Io(_) => "supervisor_io",
        }
    }
}

/// # Errors produced by per-connection handler code.
///
/// A handler failure is caught by the worker runtime, logged, and the
/// connection is closed; the worker keeps serving.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The connection's byte stream failed under the handler.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Application-level failure with a free-form reason.
    #[error("{reason}")]
    Fail { reason: String },
}

impl HandlerError {
    /// Builds an application-level failure from any displayable reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        HandlerError::Fail {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Io(_) => "handler_io",
            HandlerError::Fail { .. } => "handler_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(SupervisorError::NoListeners.as_label(), "supervisor_no_listeners");
        assert_eq!(HandlerError::fail("nope").as_label(), "handler_failed");
    }

    #[test]
    fn io_errors_convert() {
        let err: HandlerError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.as_label(), "handler_io");
    }
}
