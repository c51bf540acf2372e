//! Pipe plumbing for the parent↔worker control channel.
//!
//! Each worker gets two unnamed pipes: upstream (child-write →
//! parent-read) for status and heartbeats, downstream (parent-write →
//! child-read) for reload and detach. Every end has a single owner;
//! closing the write side is how the read side learns the peer is gone.
//!
//! Readiness goes through `poll(2)`. Parent-side broadcast writes are
//! non-blocking with a per-writer deadline so one stalled worker cannot
//! hold up the rest of a fan-out.

use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Outcome of a readiness wait on a single fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The fd is readable/writable (possibly with a pending hangup).
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// The peer hung up or the fd is invalid, with no data pending.
    Closed,
}

/// Creates one unidirectional pipe, returned as `(read, write)`.
pub fn pipe_pair() -> io::Result<(File, File)> {
    let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
    Ok((File::from(read), File::from(write)))
}

/// Marks an fd non-blocking.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a live fd with valid F_GETFL/F_SETFL arguments.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Waits for one fd to become readable.
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<Readiness> {
    wait_single(fd, libc::POLLIN, timeout)
}

/// Waits for one fd to become writable.
pub fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<Readiness> {
    wait_single(fd, libc::POLLOUT, timeout)
}

/// Polls a set of fds for readability, returning the indices that are
/// ready (data pending or peer hung up — either way a read will not
/// block and will resolve the fd's fate).
pub fn ready_indices(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    if fds.is_empty() {
        if let Some(timeout) = timeout {
            std::thread::sleep(timeout);
        }
        return Ok(Vec::new());
    }

    let mut poll_fds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let ready = poll_retry(&mut poll_fds, timeout)?;
    if ready == 0 {
        return Ok(Vec::new());
    }

    Ok(poll_fds
        .iter()
        .enumerate()
        .filter(|(_, p)| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0)
        .map(|(idx, _)| idx)
        .collect())
}

/// Writes the whole buffer to a non-blocking fd within `deadline`,
/// waiting for writability between partial writes. Used for parent-side
/// broadcast fan-out; callers swallow the error and leave the dead
/// worker to end-of-stream cleanup.
pub fn write_deadline(fd: RawFd, buf: &[u8], deadline: Duration) -> io::Result<()> {
    let started = Instant::now();
    let mut offset = 0;

    while offset < buf.len() {
        let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "broadcast write deadline exceeded",
            ));
        };
        match wait_writable(fd, Some(remaining))? {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "broadcast write deadline exceeded",
                ));
            }
            Readiness::Closed => {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
        }

        let chunk = &buf[offset..];
        // SAFETY: chunk points at valid initialized memory of chunk.len() bytes.
        let written = unsafe { libc::write(fd, chunk.as_ptr().cast(), chunk.len()) };
        if written < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
        offset += written as usize;
    }
    Ok(())
}

fn wait_single(fd: RawFd, events: i16, timeout: Option<Duration>) -> io::Result<Readiness> {
    let mut poll_fds = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    let ready = poll_retry(&mut poll_fds, timeout)?;
    if ready == 0 {
        return Ok(Readiness::TimedOut);
    }
    let revents = poll_fds[0].revents;
    if revents & events != 0 {
        Ok(Readiness::Ready)
    } else if revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
        Ok(Readiness::Closed)
    } else {
        Ok(Readiness::TimedOut)
    }
}

/// `poll(2)` with EINTR retry against a fixed deadline.
fn poll_retry(poll_fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<i32> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .map_or(0, ceil_millis),
        };
        // SAFETY: poll_fds is a valid pollfd slice for the call's duration.
        let ready = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout_ms) };
        if ready >= 0 {
            return Ok(ready);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn ceil_millis(d: Duration) -> i32 {
    let ms = (d.as_nanos() + 999_999) / 1_000_000;
    ms.min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_carries_bytes() {
        let (mut read, mut write) = pipe_pair().expect("pipe");
        write.write_all(b"ping").expect("write");
        let mut buf = [0u8; 4];
        read.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn readable_reports_timeout_then_data() {
        let (read, mut write) = pipe_pair().expect("pipe");
        let fd = read.as_raw_fd();
        assert_eq!(
            wait_readable(fd, Some(Duration::from_millis(20))).expect("poll"),
            Readiness::TimedOut
        );
        write.write_all(b"x").expect("write");
        assert_eq!(
            wait_readable(fd, Some(Duration::from_millis(20))).expect("poll"),
            Readiness::Ready
        );
    }

    #[test]
    fn hangup_is_visible() {
        let (read, write) = pipe_pair().expect("pipe");
        let fd = read.as_raw_fd();
        drop(write);
        let ready = ready_indices(&[fd], Some(Duration::from_millis(20))).expect("poll");
        assert_eq!(ready, vec![0]);
    }

    #[test]
    fn deadline_write_fails_when_pipe_is_full() {
        let (_read, write) = pipe_pair().expect("pipe");
        let fd = write.as_raw_fd();
        set_nonblocking(fd).expect("nonblocking");
        // Nobody reads, so a large enough payload must hit the deadline.
        let payload = vec![0u8; 1 << 22];
        let err = write_deadline(fd, &payload, Duration::from_millis(50)).expect_err("deadline");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn empty_fd_set_times_out() {
        let started = Instant::now();
        let ready = ready_indices(&[], Some(Duration::from_millis(30))).expect("poll");
        assert!(ready.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
