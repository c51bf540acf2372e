//! Parent supervisor: owns the listeners, forks the worker population,
//! and keeps it sized to the offered load.
//!
//! The main loop is single-threaded and tick-driven: apply any pending
//! reload, select on every worker's upstream pipe for 100 ms, run the
//! watchdog, reap exited children, then spawn whatever the population
//! arithmetic asks for. Control calls (`stop`, `halt`, `reload_*`,
//! `detach_children`) may come from other threads; the supervisor value
//! is a cheap clone around shared state.

use std::collections::HashMap;
use std::fs::File;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::channel;
use crate::codec::{self, FrameReader};
use crate::config::Options;
use crate::error::SupervisorError;
use crate::handler::HandlerRef;
use crate::hooks::{self, ExitStatus, Hooks, HooksRef, NoHooks};
use crate::listener;
use crate::message::{Command, StatusUpdate, WorkerState};
use crate::signal;
use crate::worker::Worker;

/// Cadence of one supervisory tick.
const TICK: Duration = Duration::from_millis(100);
/// Per-writer cap on a broadcast write.
const BROADCAST_DEADLINE: Duration = Duration::from_secs(1);
/// How long `detach_children` observes workers leaving `run`.
const DETACH_WINDOW: Duration = Duration::from_secs(5);
/// Foreground reap budget during shutdown before handing off to a
/// background reaper.
const SHUTDOWN_REAP_BUDGET: Duration = Duration::from_secs(1);
/// Grace between the watchdog's first strike and the follow-up KILL.
const WATCHDOG_KILL_GRACE: Duration = Duration::from_secs(60);

/// Parent-side record of one worker process.
struct WorkerEntry {
    pid: Pid,
    reader: FrameReader<File>,
    /// Downstream write end; `None` once closed during shutdown.
    writer: Option<File>,
    state: WorkerState,
    connections: HashMap<u64, String>,
    last_heartbeat: Instant,
    signal_sent: bool,
}

/// Everything the supervisory tick mutates, under one lock.
struct State {
    listeners: Vec<Arc<TcpListener>>,
    owned: bool,
    bound_addr: Option<(String, u16)>,
    options: Options,
    workers: HashMap<i32, WorkerEntry>,
    /// Pids whose pipes hit end-of-stream, still awaiting `waitpid`.
    zombies: Vec<Pid>,
}

enum ReloadTarget {
    Keep,
    Bind { host: String, port: u16 },
    Listeners(Vec<Arc<TcpListener>>),
}

struct Reload {
    target: ReloadTarget,
    options: Options,
}

struct Inner {
    state: Mutex<State>,
    pending: Mutex<Option<Reload>>,
    hooks: Mutex<HooksRef>,
    running: AtomicBool,
}

/// Prefork TCP server supervisor.
///
/// Construct with one of the binding constructors, then call
/// [`start`](Supervisor::start) with a handler. `start` blocks for the
/// supervisor's lifetime; clone the value first to issue control calls
/// from elsewhere.
///
/// ```no_run
/// use forkvisor::{HandlerFn, Options, Supervisor};
///
/// let supervisor = Supervisor::bind_address("127.0.0.1", 7000, Options::default())?;
/// let control = supervisor.clone();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(60));
///     control.stop();
/// });
/// supervisor.start(HandlerFn::arc(|_stream, _peer, _worker| Ok(())));
/// # Ok::<(), forkvisor::SupervisorError>(())
/// ```
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Binds `port` on all interfaces and owns the listener.
    pub fn bind_port(port: u16, options: Options) -> Result<Self, SupervisorError> {
        Self::bind_address("0.0.0.0", port, options)
    }

    /// Binds `host:port` and owns the listener.
    pub fn bind_address(
        host: &str,
        port: u16,
        options: Options,
    ) -> Result<Self, SupervisorError> {
        let bound = listener::bind_retry(host, port, options.listen_backlog)?;
        Ok(Self::from_parts(
            vec![Arc::new(bound)],
            true,
            Some((host.to_string(), port)),
            options,
        ))
    }

    /// Serves on a caller-supplied listener; the supervisor never
    /// closes it while running.
    pub fn with_listener(
        listener: TcpListener,
        options: Options,
    ) -> Result<Self, SupervisorError> {
        Self::with_listeners(vec![listener], options)
    }

    /// Serves on a caller-supplied listener set.
    pub fn with_listeners(
        listeners: Vec<TcpListener>,
        options: Options,
    ) -> Result<Self, SupervisorError> {
        if listeners.is_empty() {
            return Err(SupervisorError::NoListeners);
        }
        for listener in &listeners {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::from_parts(
            listeners.into_iter().map(Arc::new).collect(),
            false,
            None,
            options,
        ))
    }

    fn from_parts(
        listeners: Vec<Arc<TcpListener>>,
        owned: bool,
        bound_addr: Option<(String, u16)>,
        options: Options,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    listeners,
                    owned,
                    bound_addr,
                    options,
                    workers: HashMap::new(),
                    zombies: Vec::new(),
                }),
                pending: Mutex::new(None),
                hooks: Mutex::new(Arc::new(NoHooks)),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Installs lifecycle hooks; chainable at construction time.
    pub fn with_hooks(self, hooks: impl Hooks) -> Self {
        *self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(hooks);
        self
    }

    /// Runs the supervision loop until [`stop`](Supervisor::stop) or
    /// [`halt`](Supervisor::halt). Loop-internal failures are logged
    /// and recovered from, never surfaced here.
    pub fn start(&self, handler: HandlerRef) {
        signal::ignore_sigpipe();
        self.inner.running.store(true, Ordering::SeqCst);
        info!("supervisor started");

        while self.inner.running.load(Ordering::SeqCst) {
            self.apply_pending_reload();
            {
                let mut state = self.state();
                let hooks = self.hooks();
                watch_children(&mut state, TICK);
                watchdog(&mut state);
                reap(&mut state, &hooks);
                adjust_children(&mut state, &hooks, &handler);
            }
            // The tick holds the state lock; this gap lets control
            // calls from other threads grab it.
            thread::sleep(Duration::from_millis(1));
        }

        self.shutdown_tail();
    }

    /// Requests a graceful stop: the loop exits after the current tick
    /// and workers drain as their connections finish.
    pub fn stop(&self) {
        info!("stop requested");
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Forceful stop: SIGTERM to every worker, then stop.
    pub fn halt(&self) {
        info!("halt requested");
        {
            let state = self.state();
            for entry in state.workers.values() {
                signal::send(entry.pid, Signal::SIGTERM);
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Tells every worker to close its listeners and exit once its
    /// current connections end, then waits up to five seconds for all
    /// of them to report leaving `run`.
    pub fn detach_children(&self) {
        let mut state = self.state();
        let hooks = self.hooks();
        info!(workers = state.workers.len(), "detaching workers");
        broadcast(&state, &Command::detach());

        let deadline = Instant::now() + DETACH_WINDOW;
        while state.workers.values().any(|entry| entry.state.is_live()) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                warn!("workers still running after detach window");
                break;
            };
            watch_children(&mut state, left.min(TICK));
            reap(&mut state, &hooks);
        }
    }

    /// Enqueues new options, applied at the top of the next tick.
    pub fn reload_options(&self, options: Options) {
        self.enqueue_reload(Reload {
            target: ReloadTarget::Keep,
            options,
        });
    }

    /// Enqueues a rebind of `port` on all interfaces plus new options.
    pub fn reload_port(&self, port: u16, options: Options) {
        self.reload_bind("0.0.0.0", port, options);
    }

    /// Enqueues a rebind to `host:port` plus new options. Workers on
    /// the old sockets are detached and drain out.
    pub fn reload_bind(&self, host: &str, port: u16, options: Options) {
        self.enqueue_reload(Reload {
            target: ReloadTarget::Bind {
                host: host.to_string(),
                port,
            },
            options,
        });
    }

    /// Enqueues replacement caller-supplied listeners plus new options.
    pub fn reload_listeners(&self, listeners: Vec<TcpListener>, options: Options) {
        for listener in &listeners {
            if let Err(err) = listener.set_nonblocking(true) {
                warn!(error = %err, "failed to mark replacement listener non-blocking");
            }
        }
        self.enqueue_reload(Reload {
            target: ReloadTarget::Listeners(listeners.into_iter().map(Arc::new).collect()),
            options,
        });
    }

    /// Socket addresses of the current listener set. Useful when the
    /// supervisor was bound to port 0.
    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.state()
            .listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Number of live (`run`) workers currently tracked.
    pub fn worker_count(&self) -> usize {
        self.state()
            .workers
            .values()
            .filter(|entry| entry.state.is_live())
            .count()
    }

    /// Whether the supervision loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn enqueue_reload(&self, reload: Reload) {
        *self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reload);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> HooksRef {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_pending_reload(&self) {
        let Some(reload) = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let mut state = self.state();
        info!("applying reload");

        match reload.target {
            ReloadTarget::Bind { host, port }
                if state.bound_addr.as_ref() != Some(&(host.clone(), port)) =>
            {
                // Old sockets must close before the same address can be
                // reclaimed; existing workers keep draining on their
                // inherited copies.
                if state.owned {
                    state.listeners.clear();
                }
                broadcast(&state, &Command::detach());
                match listener::bind_retry(&host, port, reload.options.listen_backlog) {
                    Ok(bound) => {
                        state.listeners = vec![Arc::new(bound)];
                        state.owned = true;
                        state.bound_addr = Some((host, port));
                    }
                    Err(err) => {
                        error!(label = err.as_label(), error = %err, "rebind failed; supervisor has no listeners");
                        state.listeners = Vec::new();
                        state.owned = true;
                        state.bound_addr = None;
                    }
                }
            }
            ReloadTarget::Listeners(listeners) => {
                broadcast(&state, &Command::detach());
                state.listeners = listeners;
                state.owned = false;
                state.bound_addr = None;
            }
            _ => {
                // Same address (or no address change): only a backlog
                // difference needs socket work.
                if state.owned && state.options.listen_backlog != reload.options.listen_backlog {
                    if let Some(backlog) = reload.options.listen_backlog {
                        for listener in &state.listeners {
                            if let Err(err) = listener::apply_backlog(listener, backlog) {
                                warn!(error = %err, "failed to reapply listen backlog");
                            }
                        }
                    }
                }
            }
        }

        state.options = reload.options.clone();
        broadcast(&state, &Command::reload(reload.options));
    }

    /// Shutdown tail: release owned listeners, signal detach by closing
    /// every downstream writer, reap within a 1 s budget, then hand any
    /// stragglers to a detached background reaper.
    fn shutdown_tail(&self) {
        let mut state = self.state();
        let hooks = self.hooks();

        if state.owned {
            state.listeners.clear();
        }
        for entry in state.workers.values_mut() {
            entry.writer = None;
        }

        let deadline = Instant::now() + SHUTDOWN_REAP_BUDGET;
        while !(state.workers.is_empty() && state.zombies.is_empty()) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            watch_children(&mut state, left.min(TICK));
            reap(&mut state, &hooks);
        }

        let remaining = state.workers.len() + state.zombies.len();
        if remaining > 0 {
            info!(remaining, "handing remaining workers to background reaper");
            let workers = std::mem::take(&mut state.workers);
            let zombies = std::mem::take(&mut state.zombies);
            let spawned = thread::Builder::new()
                .name("forkvisor-reaper".into())
                .spawn(move || background_reap(workers, zombies, hooks));
            if let Err(err) = spawned {
                warn!(error = %err, "failed to spawn background reaper");
            }
        }
        info!("supervisor stopped");
    }
}

/// One select pass over every worker's upstream pipe: merge status,
/// refresh heartbeats, and turn end-of-stream into zombie tracking.
fn watch_children(state: &mut State, timeout: Duration) {
    // Frames already buffered behind a previous read are invisible to
    // poll; drain those workers first.
    let buffered: Vec<i32> = state
        .workers
        .iter()
        .filter(|(_, entry)| entry.reader.has_buffered_data())
        .map(|(&pid, _)| pid)
        .collect();
    let mut gone = Vec::new();
    for pid in buffered {
        drain_status(state, pid, &mut gone);
    }

    let polled: Vec<(i32, RawFd)> = state
        .workers
        .iter()
        .map(|(&pid, entry)| (pid, entry.reader.get_ref().as_raw_fd()))
        .collect();
    let fds: Vec<RawFd> = polled.iter().map(|&(_, fd)| fd).collect();
    match channel::ready_indices(&fds, Some(timeout)) {
        Ok(ready) => {
            for idx in ready {
                drain_status(state, polled[idx].0, &mut gone);
            }
        }
        Err(err) => warn!(error = %err, "status poll failed"),
    }

    for pid in gone {
        if let Some(entry) = state.workers.remove(&pid) {
            debug!(pid, "worker pipe closed");
            // Dropping the entry closes both pipe ends; the pid stays
            // tracked until waitpid confirms the exit.
            state.zombies.push(entry.pid);
        }
    }
}

/// Reads every frame a worker has ready; records end-of-stream in
/// `gone`.
fn drain_status(state: &mut State, pid: i32, gone: &mut Vec<i32>) {
    let Some(entry) = state.workers.get_mut(&pid) else {
        return;
    };
    loop {
        match entry.reader.recv::<StatusUpdate>() {
            Ok(Some(update)) => {
                if let Some(to) = update.state {
                    if to >= entry.state {
                        entry.state = to;
                    }
                }
                if let Some(connections) = update.connections {
                    entry.connections = connections;
                }
                entry.last_heartbeat = Instant::now();
                if !entry.reader.has_buffered_data() {
                    return;
                }
            }
            Ok(None) => {
                gone.push(pid);
                return;
            }
            Err(err) => {
                warn!(pid, error = %err, "status read failed");
                gone.push(pid);
                return;
            }
        }
    }
}

/// Heartbeat enforcement: first the configured signal, then an
/// unconditional KILL one minute later.
fn watchdog(state: &mut State) {
    let timer = state.options.watchdog_timer;
    if timer.is_zero() {
        return;
    }
    let strike = signal::parse(&state.options.watchdog_signal).unwrap_or(Signal::SIGTERM);

    for entry in state.workers.values_mut() {
        let silence = entry.last_heartbeat.elapsed();
        if silence > timer + WATCHDOG_KILL_GRACE {
            debug!(pid = entry.pid.as_raw(), "watchdog kill");
            signal::send(entry.pid, Signal::SIGKILL);
        } else if silence > timer && !entry.signal_sent {
            warn!(
                pid = entry.pid.as_raw(),
                silence_secs = silence.as_secs(),
                %strike,
                "worker missed its heartbeat deadline"
            );
            signal::send(entry.pid, strike);
            entry.signal_sent = true;
        }
    }
}

/// Non-blocking reap over every tracked pid. "Not yet" is not an error;
/// the pid is retried next tick.
fn reap(state: &mut State, hooks: &HooksRef) {
    let tracked: Vec<Pid> = state
        .workers
        .values()
        .map(|entry| entry.pid)
        .chain(state.zombies.iter().copied())
        .collect();

    for pid in tracked {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(pid, code)) => {
                child_exited(state, hooks, pid, ExitStatus::Code(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                child_exited(state, hooks, pid, ExitStatus::Signal(sig as i32));
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => {
                // Someone else reaped it (or it never was ours); stop
                // tracking but report nothing.
                state.workers.remove(&pid.as_raw());
                state.zombies.retain(|z| *z != pid);
            }
            Err(errno) => warn!(pid = pid.as_raw(), %errno, "waitpid failed"),
        }
    }
}

fn child_exited(state: &mut State, hooks: &HooksRef, pid: Pid, status: ExitStatus) {
    state.workers.remove(&pid.as_raw());
    state.zombies.retain(|z| *z != pid);
    info!(pid = pid.as_raw(), ?status, "worker exited");
    hooks::guarded("on_child_exit", || {
        hooks.on_child_exit(pid.as_raw(), status)
    });
}

/// Population control: fill to the floor, then add capacity for the
/// current load plus the standby headroom, up to the ceiling.
fn adjust_children(state: &mut State, hooks: &HooksRef, handler: &HandlerRef) {
    let live = state
        .workers
        .values()
        .filter(|entry| entry.state.is_live())
        .count();
    let connections: usize = state
        .workers
        .values()
        .map(|entry| entry.connections.len())
        .sum();

    let budget = spawn_budget(live, connections, &state.options);
    for _ in 0..budget {
        if let Err(err) = spawn_worker(state, hooks, handler) {
            error!(label = err.as_label(), error = %err, "worker spawn failed");
            break;
        }
    }
}

/// How many workers to add this tick.
fn spawn_budget(live: usize, connections: usize, options: &Options) -> usize {
    let max_threads = options.max_threads.max(1);
    let mut budget = options.min_processes.saturating_sub(live);
    let live_after = live + budget;

    let capacity = live_after * max_threads;
    let wanted = connections + options.standby_threads;
    if wanted > capacity {
        let required = (wanted - capacity).div_ceil(max_threads);
        let headroom = options.max_processes.saturating_sub(live_after);
        budget += required.min(headroom);
    }
    budget
}

/// Forks one worker. The child closes every parent-side and sibling
/// pipe end, runs `on_start` and then the worker runtime, and hard-exits
/// when the runtime returns. The parent records the entry as live with
/// a fresh heartbeat — which deliberately makes a just-forked worker
/// watchdog-eligible immediately — and fires `on_child_start`.
fn spawn_worker(
    state: &mut State,
    hooks: &HooksRef,
    handler: &HandlerRef,
) -> Result<(), SupervisorError> {
    let (up_read, up_write) = channel::pipe_pair()?;
    let (down_read, down_write) = channel::pipe_pair()?;

    // SAFETY: the supervisory loop is the forking thread; the child
    // only touches state reachable from it before hard-exiting.
    match unsafe { fork() }.map_err(|errno| SupervisorError::Fork { errno })? {
        ForkResult::Child => {
            drop(up_read);
            drop(down_write);
            // Sibling pipe ends came along with the fork; close them
            // all so sibling end-of-stream semantics stay intact.
            state.workers.clear();
            state.zombies.clear();

            let listeners: Vec<TcpListener> = state
                .listeners
                .iter()
                .filter_map(|listener| listener.try_clone().ok())
                .collect();

            hooks::guarded("on_start", || hooks.on_start());
            let worker = Worker::new(
                listeners,
                state.options.clone(),
                up_write,
                down_read,
                hooks.clone(),
            );
            worker.start(handler.clone());
            // Hard exit: never run the parent's atexit machinery twice.
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => {
            drop(up_write);
            drop(down_read);
            channel::set_nonblocking(down_write.as_raw_fd())?;

            state.workers.insert(
                child.as_raw(),
                WorkerEntry {
                    pid: child,
                    reader: FrameReader::new(up_read),
                    writer: Some(down_write),
                    state: WorkerState::Run,
                    connections: HashMap::new(),
                    last_heartbeat: Instant::now(),
                    signal_sent: false,
                },
            );
            info!(pid = child.as_raw(), "worker spawned");
            hooks::guarded("on_child_start", || hooks.on_child_start(child.as_raw()));
            Ok(())
        }
    }
}

/// Fan-out of one command to every worker, with per-writer isolation:
/// a stalled or dead worker costs at most the write deadline and is
/// left to end-of-stream cleanup.
fn broadcast(state: &State, command: &Command) {
    let frame = match codec::encode(command) {
        Ok(frame) => frame,
        Err(err) => {
            error!(error = %err, "failed to encode broadcast");
            return;
        }
    };

    for entry in state.workers.values() {
        let Some(writer) = &entry.writer else {
            continue;
        };
        if let Err(err) = channel::write_deadline(writer.as_raw_fd(), &frame, BROADCAST_DEADLINE) {
            debug!(pid = entry.pid.as_raw(), error = %err, "broadcast write failed");
        }
    }
}

/// Continues reaping after `start` has returned control to the caller.
fn background_reap(workers: HashMap<i32, WorkerEntry>, zombies: Vec<Pid>, hooks: HooksRef) {
    let mut state = State {
        listeners: Vec::new(),
        owned: false,
        bound_addr: None,
        options: Options::default(),
        workers,
        zombies,
    };
    while !(state.workers.is_empty() && state.zombies.is_empty()) {
        watch_children(&mut state, TICK);
        reap(&mut state, &hooks);
    }
    debug!("background reaper finished");
}
