//! Worker runtime: the half of the system that lives in child
//! processes.
//!
//! A worker owns the inherited listeners, a pair of control-pipe ends,
//! and the live options. Two infrastructure activities share the
//! process — the accept loop and the control loop — plus one thread per
//! in-flight connection, all coordinated by a single mutex and condvar
//! over the in-flight set.
//!
//! The runtime is embeddable: [`Worker::start`] returns after the drain
//! instead of exiting the process, so the same code path runs forked
//! under a [`Supervisor`](crate::Supervisor) or in-process in tests.
//! The supervisor's fork glue performs the hard exit afterwards.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::channel::{self, Readiness};
use crate::codec::{FrameReader, FrameWriter};
use crate::config::Options;
use crate::handler::HandlerRef;
use crate::hooks::{self, HooksRef};
use crate::message::{Command, StatusUpdate, WorkerState};
use crate::signal;

/// Downstream silence after which a heartbeat goes upstream.
const CONTROL_TICK: Duration = Duration::from_secs(5);
/// Upper bound on one listener readiness wait, so stop and detach are
/// observed promptly even when `max_idle` is disabled.
const ACCEPT_SLICE: Duration = Duration::from_secs(1);

/// State guarded by the worker's one mutex.
struct Flight {
    state: WorkerState,
    in_flight: HashMap<u64, String>,
    use_count: u64,
    next_task: u64,
}

/// Coordination hub shared by the accept loop, the control loop, and
/// every handler task.
pub(crate) struct Shared {
    flight: Mutex<Flight>,
    capacity: Condvar,
    options: RwLock<Options>,
    upstream: Mutex<FrameWriter<File>>,
}

impl Shared {
    fn new(options: Options, upstream: File) -> Self {
        Self {
            flight: Mutex::new(Flight {
                state: WorkerState::Run,
                in_flight: HashMap::new(),
                use_count: 0,
                next_task: 0,
            }),
            capacity: Condvar::new(),
            options: RwLock::new(options),
            upstream: Mutex::new(FrameWriter::new(upstream)),
        }
    }

    fn flight(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self) -> Options {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> WorkerState {
        self.flight().state
    }

    /// Advances the lifecycle state, refusing to move backward.
    /// Returns whether anything changed; a change wakes the accept loop
    /// and reports upstream.
    fn transition(&self, to: WorkerState) -> bool {
        {
            let mut flight = self.flight();
            if to <= flight.state {
                return false;
            }
            debug_assert!(to != WorkerState::Exit || flight.in_flight.is_empty());
            flight.state = to;
        }
        self.capacity.notify_all();
        self.send_status();
        true
    }

    /// Snapshots state + connections and reports them upstream.
    fn send_status(&self) {
        let update = {
            let flight = self.flight();
            StatusUpdate {
                state: Some(flight.state),
                connections: Some(flight.in_flight.clone()),
            }
        };
        self.write_upstream(&update);
    }

    fn write_upstream(&self, update: &StatusUpdate) {
        let mut writer = self.upstream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writer.send(update) {
            // Peer-gone is not our problem; the parent reaps us by EOF.
            debug!(error = %err, "status write failed, parent likely gone");
        }
    }
}

/// Read-only view of a worker, handed to every handler invocation.
#[derive(Clone)]
pub struct WorkerContext {
    shared: Arc<Shared>,
}

impl WorkerContext {
    /// Snapshot of the live options; reflects reloads as they land.
    pub fn options(&self) -> Options {
        self.shared.options()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Connections accepted by this worker since it started.
    pub fn use_count(&self) -> u64 {
        self.shared.flight().use_count
    }

    /// Handler tasks currently in flight.
    pub fn active_connections(&self) -> usize {
        self.shared.flight().in_flight.len()
    }
}

/// A worker runtime instance.
///
/// Normally constructed inside a freshly forked child by the
/// supervisor; constructing one directly runs the identical runtime
/// in-process, which is how the worker test suite drives it.
pub struct Worker {
    listeners: Vec<TcpListener>,
    shared: Arc<Shared>,
    downstream: FrameReader<File>,
    hooks: HooksRef,
}

impl Worker {
    /// Builds a worker from inherited listeners, initial options, and
    /// its two control-pipe ends.
    pub fn new(
        listeners: Vec<TcpListener>,
        options: Options,
        upstream: File,
        downstream: File,
        hooks: HooksRef,
    ) -> Self {
        Self {
            listeners,
            shared: Arc::new(Shared::new(options, upstream)),
            downstream: FrameReader::new(downstream),
            hooks,
        }
    }

    /// Read-only handle onto this worker.
    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            shared: self.shared.clone(),
        }
    }

    /// Runs the worker until graceful stop or fatal error.
    ///
    /// Accepts connections while capacity allows, drains on idle/use
    /// limits or a parent detach, then closes its listener handles,
    /// reports a final status, joins in-flight handlers, and moves to
    /// `exit` before returning.
    pub fn start(self, handler: HandlerRef) {
        signal::ignore_sigpipe();
        let Worker {
            listeners,
            shared,
            downstream,
            hooks,
        } = self;

        for listener in &listeners {
            if let Err(err) = listener.set_nonblocking(true) {
                warn!(error = %err, "failed to mark listener non-blocking");
            }
        }

        let control = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("forkvisor-control".into())
                .spawn(move || control_loop(&shared, downstream, &hooks))
        };
        if let Err(err) = &control {
            error!(error = %err, "failed to spawn control thread");
        }

        shared.send_status();
        let mut tasks = Vec::new();
        accept_loop(&listeners, &shared, &handler, &mut tasks);

        // Drain: stop listening, then let in-flight connections finish.
        drop(listeners);
        shared.send_status();
        for task in tasks {
            let _ = task.join();
        }
        shared.transition(WorkerState::Exit);
        info!("worker drained");
        // The control thread notices `exit` on its next tick; under a
        // supervisor the process is gone before that matters.
    }
}

/// Accept activity: block below the concurrency cap, wait for a
/// readable listener within the idle budget, accept without blocking,
/// and hand the connection to a handler task.
fn accept_loop(
    listeners: &[TcpListener],
    shared: &Arc<Shared>,
    handler: &HandlerRef,
    tasks: &mut Vec<JoinHandle<()>>,
) {
    let fds: Vec<RawFd> = listeners.iter().map(|l| l.as_raw_fd()).collect();

    'serve: loop {
        // Gate on capacity; reloads may grow max_threads under us.
        {
            let mut flight = shared.flight();
            loop {
                if flight.state != WorkerState::Run {
                    break 'serve;
                }
                let max_threads = shared.options().max_threads.max(1);
                if flight.in_flight.len() < max_threads {
                    break;
                }
                flight = shared
                    .capacity
                    .wait(flight)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        tasks.retain(|task| !task.is_finished());

        let options = shared.options();
        let accepted_before = shared.flight().use_count > 0;
        // The idle clock only runs once the worker has accepted at
        // least one connection.
        let idle_deadline = options
            .max_idle
            .filter(|_| accepted_before)
            .map(|idle| Instant::now() + idle);

        let (stream, peer) = 'wait: loop {
            if shared.state() != WorkerState::Run {
                break 'serve;
            }

            let slice = match idle_deadline {
                None => ACCEPT_SLICE,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) => left.min(ACCEPT_SLICE),
                    None => {
                        info!("idle limit reached, draining");
                        shared.transition(WorkerState::Stop);
                        break 'serve;
                    }
                },
            };

            let ready = match channel::ready_indices(&fds, Some(slice)) {
                Ok(ready) => ready,
                Err(err) => {
                    error!(error = %err, "listener poll failed, draining");
                    shared.transition(WorkerState::Stop);
                    break 'serve;
                }
            };

            for idx in ready {
                match listeners[idx].accept() {
                    Ok(conn) => break 'wait conn,
                    // Lost the race to a sibling; back to waiting.
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        error!(error = %err, "accept failed, draining");
                        shared.transition(WorkerState::Stop);
                        break 'serve;
                    }
                }
            }
        };

        // Register before spawning so the capacity gate never sees a
        // connection that is accepted but not yet counted.
        let (task_id, use_count) = {
            let mut flight = shared.flight();
            flight.use_count += 1;
            flight.next_task += 1;
            let task_id = flight.next_task;
            flight.in_flight.insert(task_id, peer.to_string());
            (task_id, flight.use_count)
        };
        shared.send_status();
        debug!(%peer, use_count, "accepted connection");

        spawn_task(shared, handler, stream, peer, task_id, tasks);

        if options.max_use > 0 && use_count >= options.max_use {
            info!(use_count, "use limit reached, draining");
            shared.transition(WorkerState::Stop);
            break;
        }
    }
}

fn spawn_task(
    shared: &Arc<Shared>,
    handler: &HandlerRef,
    stream: TcpStream,
    peer: SocketAddr,
    task_id: u64,
    tasks: &mut Vec<JoinHandle<()>>,
) {
    let task_shared = shared.clone();
    let handler = handler.clone();
    let spawned = thread::Builder::new()
        .name("forkvisor-conn".into())
        .spawn(move || run_connection(&task_shared, &handler, stream, peer, task_id));
    match spawned {
        Ok(task) => tasks.push(task),
        Err(err) => {
            // The slot was registered up front; free it again.
            error!(%peer, error = %err, "failed to spawn handler task");
            disconnect(shared, task_id);
        }
    }
}

/// One handler task: run user code, then deregister. The stream is
/// owned by the handler call, so the connection closes on every exit
/// path, panics included.
fn run_connection(
    shared: &Arc<Shared>,
    handler: &HandlerRef,
    stream: TcpStream,
    peer: SocketAddr,
    task_id: u64,
) {
    let context = WorkerContext {
        shared: shared.clone(),
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(stream, peer, &context)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(%peer, label = err.as_label(), error = %err, "connection handler failed");
        }
        Err(payload) => {
            error!(%peer, panic = hooks::panic_message(&payload), "connection handler panicked");
        }
    }

    disconnect(shared, task_id);
}

fn disconnect(shared: &Arc<Shared>, task_id: u64) {
    shared.flight().in_flight.remove(&task_id);
    shared.capacity.notify_all();
    shared.send_status();
}

/// Control activity: wait on the downstream pipe with a heartbeat
/// cadence; apply reloads; treat detach and end-of-stream as a drain
/// request.
fn control_loop(shared: &Arc<Shared>, mut downstream: FrameReader<File>, hooks: &HooksRef) {
    let fd = downstream.get_ref().as_raw_fd();

    loop {
        if shared.state() == WorkerState::Exit {
            return;
        }

        if !downstream.has_buffered_data() {
            match channel::wait_readable(fd, Some(CONTROL_TICK)) {
                Ok(Readiness::TimedOut) => {
                    shared.send_status();
                    continue;
                }
                Ok(Readiness::Ready | Readiness::Closed) => {}
                Err(err) => {
                    warn!(error = %err, "control pipe poll failed, draining");
                    shared.transition(WorkerState::Stop);
                    return;
                }
            }
        }

        match downstream.recv::<Command>() {
            Ok(Some(command)) if command.detach => {
                info!("detach requested, draining");
                shared.transition(WorkerState::Stop);
            }
            Ok(Some(command)) => {
                if let Some(options) = command.options {
                    apply_reload(shared, hooks, options);
                }
            }
            Ok(None) => {
                info!("control channel closed, draining");
                shared.transition(WorkerState::Stop);
                return;
            }
            Err(err) => {
                warn!(error = %err, "control read failed, draining");
                shared.transition(WorkerState::Stop);
                return;
            }
        }
    }
}

fn apply_reload(shared: &Arc<Shared>, hooks: &HooksRef, options: Options) {
    debug!(?options, "reloading options");
    {
        let mut live = shared
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *live = options.clone();
    }
    hooks::guarded("on_reload", || hooks.on_reload(&options));
    // max_threads may have grown; wake a saturated accept loop. The
    // flight lock fences against a waiter that has checked the old
    // options but not yet gone to sleep.
    drop(shared.flight());
    shared.capacity.notify_all();
}
