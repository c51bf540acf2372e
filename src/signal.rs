//! POSIX signal utilities for process supervision.
//!
//! The watchdog signal is configured by name (`"TERM"`, `"SIGUSR1"`,
//! …); [`parse`] resolves either spelling. Delivery goes through
//! [`send`], which treats an already-gone process as success.

use std::str::FromStr;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::warn;

/// Resolves a signal name with or without the `SIG` prefix.
pub fn parse(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).ok()
}

/// Sends a signal to a process, swallowing ESRCH: a worker that died
/// between the decision and the delivery is already what we wanted.
pub fn send(pid: Pid, signal: Signal) {
    match kill(pid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(errno) => {
            warn!(pid = pid.as_raw(), %signal, %errno, "signal delivery failed");
        }
    }
}

/// Ignores SIGPIPE for the calling process so writes to a gone peer
/// surface as EPIPE errors, which the pipe writers swallow.
pub fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler};
    // SAFETY: installing SIG_IGN for SIGPIPE is async-signal-safe and
    // has no handler code to misbehave.
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
}
