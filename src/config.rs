//! # Worker population options.
//!
//! [`Options`] defines the supervisor's behavior: population bounds,
//! per-worker concurrency, idle/use recycling, and watchdog deadlines.
//!
//! The struct is plain data and serializes as-is; this is exactly the
//! subset of configuration that crosses the control channel on reload.
//! Lifecycle callbacks live in [`Hooks`](crate::Hooks) and the connection
//! handler in [`Handler`](crate::Handler), so a forked worker keeps the
//! callbacks it was born with and only the data options travel.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use forkvisor::Options;
//!
//! let opts = Options::default()
//!     .min_processes(2)
//!     .max_processes(8)
//!     .max_threads(4)
//!     .max_idle(Duration::from_secs(30));
//!
//! assert_eq!(opts.max_processes, 8);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the worker population and per-worker behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Floor of the live worker population.
    pub min_processes: usize,
    /// Ceiling of the live worker population.
    pub max_processes: usize,
    /// Maximum concurrent connection handlers per worker.
    pub max_threads: usize,
    /// Desired headroom of acceptable-but-unused capacity above current load.
    pub standby_threads: usize,
    /// Listen backlog applied to every owned listener, when set.
    pub listen_backlog: Option<i32>,
    /// A worker drains after this much idleness since its last accept.
    /// Ignored until the worker has accepted at least once; `None` disables.
    pub max_idle: Option<Duration>,
    /// A worker drains after accepting this many connections; `0` disables.
    pub max_use: u64,
    /// Heartbeat deadline per worker before the watchdog intervenes.
    pub watchdog_timer: Duration,
    /// Signal name sent on the watchdog's first strike (e.g. `"TERM"`).
    pub watchdog_signal: String,
}

impl Default for Options {
    /// Provides the stock configuration:
    /// - `min_processes = 5`, `max_processes = 20`
    /// - `max_threads = 1`, `standby_threads = 5`
    /// - `listen_backlog = None`
    /// - `max_idle = 10s`, `max_use = 1000`
    /// - `watchdog_timer = 600s`, `watchdog_signal = "TERM"`
    fn default() -> Self {
        Self {
            min_processes: 5,
            max_processes: 20,
            max_threads: 1,
            standby_threads: 5,
            listen_backlog: None,
            max_idle: Some(Duration::from_secs(10)),
            max_use: 1000,
            watchdog_timer: Duration::from_secs(600),
            watchdog_signal: "TERM".into(),
        }
    }
}

impl Options {
    /// Sets the floor of the live worker population.
    pub fn min_processes(mut self, n: usize) -> Self {
        self.min_processes = n;
        self
    }

    /// Sets the ceiling of the live worker population.
    pub fn max_processes(mut self, n: usize) -> Self {
        self.max_processes = n;
        self
    }

    /// Sets the per-worker concurrent handler cap.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Sets the standby capacity the population is sized for.
    pub fn standby_threads(mut self, n: usize) -> Self {
        self.standby_threads = n;
        self
    }

    /// Sets the listen backlog applied to owned listeners.
    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = Some(backlog);
        self
    }

    /// Sets the idle drain deadline; pass `None` to disable.
    pub fn max_idle(mut self, idle: impl Into<Option<Duration>>) -> Self {
        self.max_idle = idle.into();
        self
    }

    /// Sets the accept-count drain threshold; `0` disables.
    pub fn max_use(mut self, uses: u64) -> Self {
        self.max_use = uses;
        self
    }

    /// Sets the per-worker heartbeat deadline.
    pub fn watchdog_timer(mut self, timer: Duration) -> Self {
        self.watchdog_timer = timer;
        self
    }

    /// Sets the signal sent on the watchdog's first strike.
    pub fn watchdog_signal(mut self, signal: impl Into<String>) -> Self {
        self.watchdog_signal = signal.into();
        self
    }
}
