//! Disk Watchdog
//!
//! Polls free space on the output volume and asks the run to stop with
//! `disk-full` once it drops below `disk_free_min_mb`. The most recent reading
//! is published on a watch channel so records can carry `disk_free_mb`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Disks;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::DiskConfig;
use crate::error::TerminationReason;
use crate::events::{AcquisitionEvent, EventBus};
use crate::session::RunSession;

/// Source of free-space readings.
pub trait FreeSpaceGauge: Send + Sync {
    /// Free megabytes on the volume holding `path`, if it can be determined.
    fn free_mb(&self, path: &Path) -> Option<u64>;
}

/// Gauge backed by `sysinfo`'s disk list.
///
/// The volume is the disk whose mount point is the longest prefix of the
/// (canonicalized) path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoGauge;

impl FreeSpaceGauge for SysinfoGauge {
    fn free_mb(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space() / (1024 * 1024))
    }
}

/// Periodic free-space check for one output root.
pub struct DiskWatchdog {
    config: DiskConfig,
    path: PathBuf,
    gauge: Arc<dyn FreeSpaceGauge>,
    free_mb: watch::Sender<Option<u64>>,
}

impl DiskWatchdog {
    pub fn new(config: DiskConfig, path: impl Into<PathBuf>, gauge: Arc<dyn FreeSpaceGauge>) -> Self {
        let (free_mb, _) = watch::channel(None);
        Self {
            config,
            path: path.into(),
            gauge,
            free_mb,
        }
    }

    /// Receiver of the latest reading.
    pub fn readings(&self) -> watch::Receiver<Option<u64>> {
        self.free_mb.subscribe()
    }

    /// Take one reading and publish it. Returns the free megabytes.
    pub async fn check(&self) -> Option<u64> {
        let gauge = self.gauge.clone();
        let path = self.path.clone();
        let free = tokio::task::spawn_blocking(move || gauge.free_mb(&path))
            .await
            .ok()
            .flatten();
        self.free_mb.send_replace(free);
        free
    }

    /// Whether `free_mb` is below the configured minimum.
    pub fn is_low(&self, free_mb: u64) -> bool {
        free_mb < self.config.disk_free_min_mb
    }

    /// Poll until the run stops or the disk fills up.
    pub fn spawn(self, session: Arc<RunSession>, events: Arc<EventBus>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_millis(self.config.disk_free_check_int_ms.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = session.stop_requested() => break,
                    _ = ticker.tick() => {}
                }

                let Some(free_mb) = self.check().await else {
                    warn!(path = %self.path.display(), "Could not determine free disk space");
                    continue;
                };
                debug!(free_mb, "Disk check");

                if self.is_low(free_mb) {
                    error!(
                        free_mb,
                        threshold_mb = self.config.disk_free_min_mb,
                        "Free disk space below minimum, stopping acquisition"
                    );
                    events
                        .publish(AcquisitionEvent::DiskLow {
                            free_mb,
                            threshold_mb: self.config.disk_free_min_mb,
                        })
                        .await;
                    session.request_stop(TerminationReason::DiskFull);
                    break;
                }
            }
        })
    }
}
