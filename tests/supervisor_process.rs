//! End-to-end supervisor scenarios with real forked workers.
//!
//! Every test here forks processes, so they serialize behind one gate
//! to keep the process table and the test process's threads calm while
//! `fork` runs.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use forkvisor::{
    ExitStatus, HandlerFn, HandlerRef, Hooks, Options, Supervisor, SupervisorError,
};

static GATE: Mutex<()> = Mutex::new(());

fn gate() -> MutexGuard<'static, ()> {
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn init_logs() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Parent-side observation of the worker population.
#[derive(Default)]
struct Counters {
    child_starts: AtomicUsize,
    child_exits: Mutex<Vec<(i32, ExitStatus)>>,
}

impl Counters {
    fn starts(&self) -> usize {
        self.child_starts.load(Ordering::SeqCst)
    }

    fn exits(&self) -> Vec<(i32, ExitStatus)> {
        self.child_exits.lock().expect("exit log").clone()
    }
}

/// Counts parent-side lifecycle events; optionally logs `on_reload`
/// invocations (which run inside worker processes) to a shared file.
struct RecordingHooks {
    counters: Arc<Counters>,
    reload_log: Option<PathBuf>,
}

impl Hooks for RecordingHooks {
    fn on_reload(&self, _options: &Options) {
        if let Some(path) = &self.reload_log {
            if let Ok(mut file) = OpenOptions::new().append(true).create(true).open(path) {
                let _ = writeln!(file, "{}", std::process::id());
            }
        }
    }

    fn on_child_start(&self, _pid: i32) {
        self.counters.child_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_child_exit(&self, pid: i32, status: ExitStatus) {
        self.counters
            .child_exits
            .lock()
            .expect("exit log")
            .push((pid, status));
    }
}

struct Cluster {
    supervisor: Supervisor,
    addr: SocketAddr,
    counters: Arc<Counters>,
    main_loop: JoinHandle<()>,
}

impl Cluster {
    fn launch(options: Options, handler: HandlerRef) -> Self {
        Self::launch_logged(options, handler, None)
    }

    fn launch_logged(options: Options, handler: HandlerRef, reload_log: Option<PathBuf>) -> Self {
        init_logs();
        let counters = Arc::new(Counters::default());
        let supervisor = Supervisor::bind_address("127.0.0.1", 0, options)
            .expect("bind")
            .with_hooks(RecordingHooks {
                counters: counters.clone(),
                reload_log,
            });
        let addr = supervisor.local_addrs()[0];

        let runner = supervisor.clone();
        let main_loop = thread::spawn(move || runner.start(handler));

        Cluster {
            supervisor,
            addr,
            counters,
            main_loop,
        }
    }

    fn shutdown(self) {
        self.supervisor.stop();
        self.main_loop.join().expect("supervisor loop");
    }
}

/// Writes one byte, then holds the connection until the client closes.
fn hold_handler() -> HandlerRef {
    HandlerFn::arc(|mut stream, _peer, _worker| {
        stream.write_all(b"+")?;
        let mut buf = [0u8; 64];
        while stream.read(&mut buf)? > 0 {}
        Ok(())
    })
}

fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).expect("connect")
}

fn served_within(stream: &mut TcpStream, budget: Duration) -> bool {
    stream.set_read_timeout(Some(budget)).expect("read timeout");
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).is_ok()
}

fn eventually(budget: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn single_worker_single_thread_serializes_clients() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .max_threads(1)
            .standby_threads(0)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.supervisor.worker_count() == 1
    }));

    let mut first = connect(cluster.addr);
    assert!(served_within(&mut first, Duration::from_secs(2)));

    let mut second = connect(cluster.addr);
    assert!(
        !served_within(&mut second, Duration::from_millis(500)),
        "a saturated single-thread worker must not serve a second client"
    );

    drop(first);
    assert!(
        served_within(&mut second, Duration::from_secs(1)),
        "freeing the only slot must unblock the waiting client"
    );

    cluster.shutdown();
}

#[test]
fn worker_threads_bound_concurrency() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .max_threads(3)
            .standby_threads(0)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.supervisor.worker_count() == 1
    }));

    let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(cluster.addr)).collect();
    for client in &mut clients {
        assert!(served_within(client, Duration::from_secs(2)));
    }

    let mut fourth = connect(cluster.addr);
    assert!(!served_within(&mut fourth, Duration::from_millis(500)));

    drop(clients.remove(0));
    assert!(served_within(&mut fourth, Duration::from_secs(1)));

    cluster.shutdown();
}

#[test]
fn processes_scale_with_load() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(3)
            .max_threads(1)
            .standby_threads(1)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.supervisor.worker_count() == 1
    }));

    // Each held connection pushes the population up by one, to the cap.
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = connect(cluster.addr);
        assert!(
            served_within(&mut client, Duration::from_secs(3)),
            "population must grow to serve each new connection"
        );
        clients.push(client);
    }
    assert!(eventually(Duration::from_secs(2), || {
        cluster.supervisor.worker_count() == 3
    }));

    let mut fourth = connect(cluster.addr);
    assert!(
        !served_within(&mut fourth, Duration::from_millis(500)),
        "max_processes must cap the population"
    );

    drop(clients.remove(0));
    assert!(served_within(&mut fourth, Duration::from_secs(2)));

    cluster.shutdown();
}

#[test]
fn population_is_sized_by_floor_and_standby() {
    let _gate = gate();

    // Floor dominates: three workers, no more.
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(3)
            .max_threads(1)
            .standby_threads(1)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(3), || {
        cluster.supervisor.worker_count() == 3
    }));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(cluster.supervisor.worker_count(), 3);
    assert_eq!(cluster.counters.starts(), 3);
    cluster.shutdown();

    // Standby dominates: ⌈10 / 2⌉ = 5 workers at idle.
    let cluster = Cluster::launch(
        Options::default()
            .max_threads(2)
            .standby_threads(10)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(3), || {
        cluster.supervisor.worker_count() == 5
    }));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(cluster.supervisor.worker_count(), 5);
    cluster.shutdown();
}

#[test]
fn idle_workers_are_recycled_after_first_use() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .max_threads(1)
            .standby_threads(0)
            .max_idle(Duration::from_millis(100)),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.counters.starts() == 1
    }));

    // Never-used workers are immune to the idle limit.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(cluster.counters.starts(), 1);
    assert_eq!(cluster.supervisor.worker_count(), 1);

    let mut client = connect(cluster.addr);
    assert!(served_within(&mut client, Duration::from_secs(2)));
    drop(client);

    // The used worker idles out and a replacement is forked.
    assert!(eventually(Duration::from_secs(3), || {
        cluster.counters.starts() == 2
    }));
    assert!(eventually(Duration::from_secs(2), || {
        cluster
            .counters
            .exits()
            .iter()
            .any(|(_, status)| status.code() == Some(0))
    }));

    cluster.shutdown();
}

#[test]
fn use_limit_recycles_worker_after_exactly_two_accepts() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .max_threads(1)
            .standby_threads(0)
            .max_idle(None)
            .max_use(2),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.counters.starts() == 1
    }));

    let mut first = connect(cluster.addr);
    assert!(served_within(&mut first, Duration::from_secs(2)));
    drop(first);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        cluster.counters.starts(),
        1,
        "one accept must not recycle a max_use=2 worker"
    );

    let mut second = connect(cluster.addr);
    assert!(served_within(&mut second, Duration::from_secs(2)));
    drop(second);
    assert!(
        eventually(Duration::from_secs(2), || cluster.counters.starts() == 2),
        "the second accept must drain the worker and fork a replacement"
    );

    cluster.shutdown();
}

#[test]
fn reload_reaches_every_worker_exactly_once() {
    let _gate = gate();
    let log = tempfile::NamedTempFile::new().expect("temp file");
    let log_path = log.path().to_path_buf();

    let options = Options::default()
        .min_processes(2)
        .max_processes(2)
        .max_threads(1)
        .standby_threads(0)
        .max_idle(None);
    let cluster = Cluster::launch_logged(options.clone(), hold_handler(), Some(log_path.clone()));
    assert!(eventually(Duration::from_secs(3), || {
        cluster.supervisor.worker_count() == 2
    }));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(std::fs::read_to_string(&log_path).expect("log").len(), 0);

    cluster.supervisor.reload_options(options.max_threads(3));

    assert!(
        eventually(Duration::from_secs(3), || {
            reload_log_pids(&log_path).len() == 2
        }),
        "every live worker must observe the reload"
    );
    thread::sleep(Duration::from_millis(300));
    let pids = reload_log_pids(&log_path);
    assert_eq!(pids.len(), 2, "reload must fire exactly once per worker");
    assert_eq!(
        pids.iter().collect::<HashSet<_>>().len(),
        2,
        "the two reload records must come from distinct workers"
    );

    cluster.shutdown();
}

fn reload_log_pids(path: &PathBuf) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[test]
fn detach_children_replaces_the_population() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .max_threads(1)
            .standby_threads(0)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.counters.starts() == 1
    }));

    let started = Instant::now();
    cluster.supervisor.detach_children();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "idle workers must detach well inside the observation window"
    );

    // The loop refills the floor with a fresh worker.
    assert!(eventually(Duration::from_secs(3), || {
        cluster.counters.starts() == 2
    }));
    assert!(eventually(Duration::from_secs(2), || {
        cluster
            .counters
            .exits()
            .iter()
            .any(|(_, status)| status.success())
    }));

    cluster.shutdown();
}

#[test]
fn halt_terminates_workers_with_sigterm() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(2)
            .max_processes(2)
            .max_threads(1)
            .standby_threads(0)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(3), || {
        cluster.supervisor.worker_count() == 2
    }));

    cluster.supervisor.halt();
    cluster.main_loop.join().expect("supervisor loop");

    assert!(eventually(Duration::from_secs(3), || {
        cluster.counters.exits().len() == 2
    }));
    for (_, status) in cluster.counters.exits() {
        assert!(
            matches!(status, ExitStatus::Signal(_)),
            "halted workers exit by signal, got {status:?}"
        );
    }
}

#[test]
fn stop_returns_while_workers_drain() {
    let _gate = gate();
    let cluster = Cluster::launch(
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .max_threads(1)
            .standby_threads(0)
            .max_idle(None),
        hold_handler(),
    );
    assert!(eventually(Duration::from_secs(2), || {
        cluster.supervisor.worker_count() == 1
    }));

    let mut held = connect(cluster.addr);
    assert!(served_within(&mut held, Duration::from_secs(2)));

    let stopped = Instant::now();
    cluster.supervisor.stop();
    cluster.main_loop.join().expect("supervisor loop");
    assert!(
        stopped.elapsed() < Duration::from_secs(3),
        "stop must hand a draining worker to the background reaper"
    );

    // The worker exits once its last connection closes.
    drop(held);
    assert!(eventually(Duration::from_secs(3), || {
        cluster
            .counters
            .exits()
            .iter()
            .any(|(_, status)| status.code() == Some(0))
    }));
}

#[test]
fn constructors_validate_listener_sets() {
    let _gate = gate();
    let err = Supervisor::with_listeners(Vec::new(), Options::default())
        .expect_err("empty listener set");
    assert!(matches!(err, SupervisorError::NoListeners));

    // A caller-supplied listener serves end to end.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let supervisor = Supervisor::with_listener(
        listener,
        Options::default()
            .min_processes(1)
            .max_processes(1)
            .standby_threads(0)
            .max_idle(None),
    )
    .expect("supervisor");
    let runner = supervisor.clone();
    let main_loop = thread::spawn(move || runner.start(hold_handler()));

    let mut client = connect(addr);
    assert!(served_within(&mut client, Duration::from_secs(3)));
    drop(client);

    supervisor.stop();
    main_loop.join().expect("supervisor loop");
}
