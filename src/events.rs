//! Typed acquisition events with an explicit subscriber list.
//!
//! Components publish `AcquisitionEvent`s instead of calling each other.
//! Each subscriber owns a bounded mpsc receiver. A subscriber that falls
//! behind loses events (logged), and a subscriber whose receiver is dropped
//! is pruned on the next publish.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::warn;

use crate::controller::SystemState;
use crate::error::TerminationReason;

/// Output path of a camera pipeline that can be disabled at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPath {
    Still,
    Video,
    Hdr,
}

impl std::fmt::Display for OutputPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputPath::Still => f.write_str("still"),
            OutputPath::Video => f.write_str("video"),
            OutputPath::Hdr => f.write_str("hdr"),
        }
    }
}

/// Something that happened during the run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AcquisitionEvent {
    /// A cycle's record was published.
    TriggerCompleted {
        sequence_number: u64,
        complete: bool,
        cameras_captured: usize,
        cameras_active: usize,
    },
    /// A bracket with `emit_signal` set finished capturing.
    BracketCaptured {
        camera_id: String,
        sequence_number: u64,
        bracket_index: usize,
        exposure_us: u32,
    },
    /// HDR merge output written.
    HdrMerged {
        camera_id: String,
        sequence_number: u64,
        path: PathBuf,
    },
    /// Camera removed after repeated failures.
    CameraDisabled { camera_id: String, failures: u32 },
    /// An encode path was disabled for the rest of the run.
    PathDisabled {
        camera_id: String,
        path: OutputPath,
        reason: String,
    },
    /// Free space dropped below the threshold.
    DiskLow { free_mb: u64, threshold_mb: u64 },
    /// Controller reported its system state.
    ControllerState { state: SystemState },
    /// Run reached `Stopped`.
    SessionStopped { reason: Option<TerminationReason> },
}

/// Fan-out of events to a list of subscribers.
#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<AcquisitionEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose subscriber channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber.
    pub async fn subscribe(&self) -> mpsc::Receiver<AcquisitionEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber. Returns the number reached.
    pub async fn publish(&self, event: AcquisitionEvent) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(?event, "Event subscriber lagging, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
