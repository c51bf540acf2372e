//! # Connection handler abstraction.
//!
//! This module defines the [`Handler`] trait and a convenient
//! function-backed implementation, [`HandlerFn`]. The common handle
//! type is [`HandlerRef`], an `Arc<dyn Handler>` shared by every worker
//! the supervisor forks.
//!
//! A handler owns its connection for the call's duration: when it
//! returns (or panics — the worker catches both), the stream drops and
//! the connection closes. The [`WorkerContext`](crate::WorkerContext)
//! argument gives read-only access to the live options, so handlers can
//! react to reloads.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use crate::error::HandlerError;
use crate::worker::WorkerContext;

/// # Shared handle to a connection handler.
///
/// This is the primary type accepted by
/// [`Supervisor::start`](crate::Supervisor::start).
pub type HandlerRef = Arc<dyn Handler>;

/// # Per-connection callback.
///
/// Runs once per accepted connection, concurrently with its siblings up
/// to the worker's `max_threads` cap. Errors are logged by the worker
/// and never stop the accept loop.
///
/// # Example
/// ```
/// use std::io::Write;
/// use std::net::{SocketAddr, TcpStream};
/// use forkvisor::{Handler, HandlerError, WorkerContext};
///
/// struct Greeter;
///
/// impl Handler for Greeter {
///     fn handle(
///         &self,
///         mut stream: TcpStream,
///         peer: SocketAddr,
///         _worker: &WorkerContext,
///     ) -> Result<(), HandlerError> {
///         writeln!(stream, "hello {peer}")?;
///         Ok(())
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Serves one accepted connection.
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        worker: &WorkerContext,
    ) -> Result<(), HandlerError>;
}

/// # Function-backed handler implementation.
///
/// Wraps a `Fn` closure; unlike a one-shot callback it must be callable
/// concurrently, since a worker runs up to `max_threads` handler tasks
/// at once. Use [`HandlerFn::arc`] for a one-liner that returns a
/// [`HandlerRef`].
pub struct HandlerFn<F>
where
    F: Fn(TcpStream, SocketAddr, &WorkerContext) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    func: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(TcpStream, SocketAddr, &WorkerContext) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    /// Creates a new function-backed handler.
    pub fn new(func: F) -> Self {
        Self { func }
    }

    /// Creates the handler and returns it as a shared handle.
    ///
    /// # Example
    /// ```
    /// use forkvisor::HandlerFn;
    ///
    /// let handler = HandlerFn::arc(|_stream, _peer, _worker| Ok(()));
    /// # let _ = handler;
    /// ```
    pub fn arc(func: F) -> HandlerRef {
        Arc::new(Self::new(func))
    }
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(TcpStream, SocketAddr, &WorkerContext) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        worker: &WorkerContext,
    ) -> Result<(), HandlerError> {
        (self.func)(stream, peer, worker)
    }
}
