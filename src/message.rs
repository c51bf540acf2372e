//! Control-channel message types.
//!
//! Workers send [`StatusUpdate`]s upstream (task starts and ends, state
//! transitions, heartbeats). The parent sends [`Command`]s downstream
//! (option reloads, detach). Both travel as JSON mappings under the
//! frame codec, FIFO within one pipe and unordered across pipes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker process.
///
/// Transitions are monotone: `run` → `stop` → `exit`, never backward.
/// Only a `run` worker counts toward the population bounds; a `stop`
/// worker is draining and may linger until its connections finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Accepting and serving connections.
    Run,
    /// Draining: no new accepts, existing connections allowed to finish.
    Stop,
    /// Fully drained; the process is about to terminate.
    Exit,
}

impl WorkerState {
    /// True for workers counted toward `min_processes`/`max_processes`.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerState::Run)
    }
}

/// Worker → parent status report.
///
/// Fields are optional so a bare `{}` works as a heartbeat; the parent
/// merges whatever is present and refreshes the sender's heartbeat
/// clock for every message received.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Current lifecycle state, when it changed or is being restated.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<WorkerState>,
    /// Live connections as handler-task id → remote address.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub connections: Option<HashMap<u64, String>>,
}

impl StatusUpdate {
    /// An empty update: proves liveness, changes nothing.
    pub fn heartbeat() -> Self {
        Self::default()
    }
}

/// Parent → worker command.
///
/// `{options: …}` replaces the worker's live options; `{detach: true}`
/// tells it to close its listeners and drain. End-of-stream on the
/// downstream pipe is read as detach.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Replacement options for a live reload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub options: Option<crate::Options>,
    /// Drain request.
    #[serde(default)]
    pub detach: bool,
}

impl Command {
    /// A reload carrying the new options.
    pub fn reload(options: crate::Options) -> Self {
        Self {
            options: Some(options),
            detach: false,
        }
    }

    /// A detach request.
    pub fn detach() -> Self {
        Self {
            options: None,
            detach: true,
        }
    }
}
