//! # forkvisor
//!
//! **Forkvisor** is a prefork TCP server supervisor.
//!
//! A parent process owns one or more listening sockets, forks a
//! population of worker processes that race on `accept`, runs a
//! user-supplied handler per connection (up to a per-worker concurrency
//! cap), and dynamically scales the population to match offered load.
//!
//! ## Features
//!
//! | Area               | Description                                                             | Key types / traits                  |
//! |--------------------|-------------------------------------------------------------------------|-------------------------------------|
//! | **Supervision**    | Population sizing, spawn/reap, watchdog, graceful vs forceful shutdown. | [`Supervisor`]                      |
//! | **Worker runtime** | Bounded accept loop, idle/use recycling, drain on stop or detach.       | [`Worker`], [`WorkerContext`]       |
//! | **Handlers**       | Per-connection callbacks, shared by every worker.                       | [`Handler`], [`HandlerFn`]          |
//! | **Hooks**          | Lifecycle observation in parent and child.                              | [`Hooks`], [`ExitStatus`]           |
//! | **Configuration**  | Population bounds, recycling limits, watchdog deadlines.                | [`Options`]                         |
//! | **Errors**         | Typed errors for the supervisor and handler code.                       | [`SupervisorError`], [`HandlerError`] |
//!
//! ```no_run
//! use std::io::Write;
//! use forkvisor::{HandlerFn, Options, Supervisor};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = Options::default().min_processes(2).max_threads(4);
//!     let supervisor = Supervisor::bind_address("127.0.0.1", 7000, options)?;
//!
//!     supervisor.start(HandlerFn::arc(|mut stream, peer, _worker| {
//!         writeln!(stream, "hello {peer}")?;
//!         Ok(())
//!     }));
//!     Ok(())
//! }
//! ```
//!
//! The design is Unix-only by nature: it relies on fork-style process
//! creation, inherited file descriptors, unnamed pipes, and POSIX
//! signal delivery.
//!
//! ---

pub mod channel;
pub mod codec;
mod config;
mod error;
mod handler;
mod hooks;
mod listener;
pub mod message;
mod signal;
mod supervisor;
mod worker;

// ---- Public re-exports ----

pub use config::Options;
pub use error::{HandlerError, SupervisorError};
pub use handler::{Handler, HandlerFn, HandlerRef};
pub use hooks::{ExitStatus, Hooks, HooksRef, NoHooks};
pub use message::{Command, StatusUpdate, WorkerState};
pub use supervisor::Supervisor;
pub use worker::{Worker, WorkerContext};
