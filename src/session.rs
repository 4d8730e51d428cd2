//! Run session state.
//!
//! One `RunSession` exists per process. It owns the run status
//! (`Running → Stopping → Stopped`), the trigger counter and the termination
//! reason. Status changes are broadcast on a `watch` channel so every
//! background task can wait for a stop without polling.
//!
//! The first stop request wins: later requests are logged but cannot change
//! the recorded reason.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::TerminationReason;

/// Lifecycle of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => f.write_str("running"),
            RunStatus::Stopping => f.write_str("stopping"),
            RunStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// State of the current collection run.
#[derive(Debug)]
pub struct RunSession {
    run_id: Uuid,
    start_time: DateTime<Utc>,
    output_root: PathBuf,
    limit: Option<u64>,
    trigger_count: AtomicU64,
    status: watch::Sender<RunStatus>,
    reason: OnceLock<TerminationReason>,
}

impl RunSession {
    /// Create a running session. `limit = None` means unlimited.
    pub fn new(output_root: impl Into<PathBuf>, limit: Option<u64>) -> Self {
        let (status, _) = watch::channel(RunStatus::Running);
        Self {
            run_id: Uuid::new_v4(),
            start_time: Utc::now(),
            output_root: output_root.into(),
            limit,
            trigger_count: AtomicU64::new(0),
            status,
            reason: OnceLock::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Root the collection directories are created under.
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Acquire)
    }

    /// True once `trigger_count` has reached a finite limit.
    pub fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.trigger_count() >= limit)
    }

    /// Count one completed cycle and return the new total.
    pub fn record_trigger(&self) -> u64 {
        self.trigger_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    /// Ask the run to stop. Returns `true` if this call recorded the reason.
    ///
    /// Moves `Running` to `Stopping`; a session already stopping or stopped
    /// keeps its status.
    pub fn request_stop(&self, reason: TerminationReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            info!(reason = reason.tag(), "Stop requested");
        } else {
            debug!(
                reason = reason.tag(),
                recorded = ?self.termination_reason(),
                "Ignoring stop request, run already stopping"
            );
        }
        self.status.send_if_modified(|status| {
            if *status == RunStatus::Running {
                *status = RunStatus::Stopping;
                true
            } else {
                false
            }
        });
        first
    }

    /// Final transition. Called by the Scheduler once pipelines are closed.
    pub fn mark_stopped(&self) {
        self.status.send_replace(RunStatus::Stopped);
    }

    /// Resolve once the run leaves `Running`.
    pub async fn stop_requested(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| *s != RunStatus::Running).await;
    }

    /// Resolve once the run is `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| *s == RunStatus::Stopped).await;
    }
}
