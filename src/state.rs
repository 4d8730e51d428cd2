//! Shared acquisition state.
//!
//! Readers (the Protocol Server) see an immutable [`StateSnapshot`] behind an
//! `Arc`; writers (the Scheduler) publish a whole new snapshot through a
//! `tokio::sync::watch` channel. Nobody holds a lock across an await, so
//! queries never stall a trigger cycle.
//!
//! Changes requested by clients travel the other way through a bounded
//! [`ConfigChange`] queue that the Scheduler drains between cycles.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::CameraConfig;
use crate::core::{AcquisitionRecord, Frame};
use crate::parameter::CameraSetting;
use crate::session::RunStatus;

/// Most recent frame of one camera.
#[derive(Clone, Debug)]
pub struct LatestImage {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub exposure_us: u32,
    pub gain: f64,
    /// Still written for this frame, if any
    pub filename: Option<PathBuf>,
    pub frame: Frame,
}

/// Point-in-time view of the run.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    /// Effective camera configuration, in configuration order
    pub cameras: Vec<CameraConfig>,
    pub trigger_rate: f64,
    pub trigger_limit: i64,
    pub trigger_count: u64,
    pub status: Option<RunStatus>,
    pub disabled_cameras: Vec<String>,
    pub latest_record: Option<Arc<AcquisitionRecord>>,
    pub latest_images: HashMap<String, LatestImage>,
    pub disk_free_mb: Option<u64>,
}

impl StateSnapshot {
    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }

    pub fn is_disabled(&self, camera_id: &str) -> bool {
        self.disabled_cameras.iter().any(|id| id == camera_id)
    }
}

/// Single-writer, many-reader snapshot cell.
#[derive(Debug)]
pub struct SharedState {
    tx: watch::Sender<Arc<StateSnapshot>>,
}

impl SharedState {
    pub fn new(initial: StateSnapshot) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.tx.subscribe()
    }

    /// Derive a new snapshot from the current one and swap it in.
    ///
    /// Readers holding the previous `Arc` keep their consistent view.
    pub fn update(&self, f: impl FnOnce(&mut StateSnapshot)) {
        self.tx.send_modify(|current| f(Arc::make_mut(current)));
    }
}

/// Change requested by a client, applied before the next cycle.
#[derive(Clone, Debug)]
pub enum ConfigChange {
    /// Update one setting of one camera
    Camera {
        camera_id: String,
        setting: CameraSetting,
    },
    TriggerRate(f64),
}

/// Create the change queue.
pub fn change_queue(capacity: usize) -> (mpsc::Sender<ConfigChange>, mpsc::Receiver<ConfigChange>) {
    mpsc::channel(capacity.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_keep_old_snapshot() {
        let state = SharedState::new(StateSnapshot {
            cameras: vec![CameraConfig::new("port")],
            trigger_rate: 5.0,
            ..StateSnapshot::default()
        });

        let before = state.snapshot();
        state.update(|s| s.trigger_rate = 2.0);
        let after = state.snapshot();

        assert_eq!(before.trigger_rate, 5.0, "held snapshot must not change");
        assert_eq!(after.trigger_rate, 2.0);
        assert!(after.camera("port").is_some());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let state = SharedState::new(StateSnapshot::default());
        let mut rx = state.subscribe();
        state.update(|s| s.trigger_count = 7);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().trigger_count, 7);
    }

    #[test]
    fn test_disabled_lookup() {
        let snapshot = StateSnapshot {
            disabled_cameras: vec!["stbd".into()],
            ..StateSnapshot::default()
        };
        assert!(snapshot.is_disabled("stbd"));
        assert!(!snapshot.is_disabled("port"));
    }
}
