//! Listening-socket setup.
//!
//! The supervisor owns listeners it binds itself and closes them on
//! rebind and shutdown; caller-supplied listeners are used but never
//! closed while the supervisor runs. All listeners are switched to
//! non-blocking mode because sibling workers race on the same socket
//! and the loser must see `EWOULDBLOCK`, not a stall.

use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::SupervisorError;

/// Total budget for retrying a bind that hits `EADDRINUSE`.
pub const BIND_RETRY_BUDGET: Duration = Duration::from_secs(5);
/// Delay between bind retries.
pub const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Binds `host:port`, retrying address-in-use for up to the retry
/// budget, then applies the configured backlog and non-blocking mode.
///
/// Address-in-use is expected during a rebind: draining workers of the
/// previous generation can hold the old socket open for a moment.
pub fn bind_retry(
    host: &str,
    port: u16,
    backlog: Option<i32>,
) -> Result<TcpListener, SupervisorError> {
    let deadline = Instant::now() + BIND_RETRY_BUDGET;
    loop {
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                if let Some(backlog) = backlog {
                    apply_backlog(&listener, backlog)
                        .map_err(|source| bind_error(host, port, source))?;
                }
                listener
                    .set_nonblocking(true)
                    .map_err(|source| bind_error(host, port, source))?;
                return Ok(listener);
            }
            Err(err)
                if err.kind() == io::ErrorKind::AddrInUse && Instant::now() < deadline =>
            {
                debug!(host, port, "address in use, retrying bind");
                thread::sleep(BIND_RETRY_DELAY);
            }
            Err(source) => return Err(bind_error(host, port, source)),
        }
    }
}

/// Re-issues `listen(2)` on a bound socket to adjust its backlog.
pub fn apply_backlog(listener: &TcpListener, backlog: i32) -> io::Result<()> {
    // SAFETY: plain syscall on a live listening socket fd.
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_error(host: &str, port: u16, source: io::Error) -> SupervisorError {
    SupervisorError::Bind {
        addr: format!("{host}:{port}"),
        source,
    }
}
