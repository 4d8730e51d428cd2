//! Application wiring.
//!
//! [`App::create`] does everything that can fail before acquisition starts
//! (settings check, run directory). [`App::run`] opens the devices, starts
//! the supporting tasks and drives the Scheduler until the run stops.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::camera::encoder::{ExternalHdrMerger, FfmpegVideoEncoder, ImageStillEncoder};
use crate::camera::{open_device, CameraPipeline, Encoders};
use crate::collection::CollectionLayout;
use crate::config::{Settings, TriggerSource};
use crate::controller::{serial, ControllerEvent, ControllerLink, OutboundFrame};
use crate::error::{AppResult, DaqError, TerminationReason};
use crate::events::{AcquisitionEvent, EventBus};
use crate::metadata::{JsonlStore, RunMetadata};
use crate::scheduler::Scheduler;
use crate::sensor_bus::SensorBus;
use crate::server::{Dispatcher, ProtocolServer};
use crate::session::RunSession;
use crate::state::{change_queue, ConfigChange, SharedState, StateSnapshot};
use crate::watchdog::{DiskWatchdog, SysinfoGauge};

const EVENT_CAPACITY: usize = 256;
const CHANGE_CAPACITY: usize = 64;

/// A prepared collection run.
pub struct App {
    settings: Settings,
    layout: CollectionLayout,
    session: Arc<RunSession>,
    sensors: Arc<SensorBus>,
    events: Arc<EventBus>,
    state: Arc<SharedState>,
    changes_tx: mpsc::Sender<ConfigChange>,
    changes_rx: mpsc::Receiver<ConfigChange>,
}

impl App {
    /// Validate `settings` and create the run directory.
    pub fn create(settings: Settings) -> AppResult<Self> {
        settings.validate()?;

        let session = Arc::new(RunSession::new(
            settings.application.output_path.clone(),
            settings.acquisition.limit(),
        ));
        let camera_ids: Vec<String> = settings.cameras.iter().map(|c| c.id.clone()).collect();
        let layout = CollectionLayout::create(
            session.output_root(),
            session.start_time(),
            settings.application.output_mode,
            &camera_ids,
        )?;

        let (changes_tx, changes_rx) = change_queue(CHANGE_CAPACITY);
        Ok(Self {
            sensors: Arc::new(SensorBus::new(settings.sensors.clone())),
            events: Arc::new(EventBus::new(EVENT_CAPACITY)),
            state: Arc::new(SharedState::new(StateSnapshot::default())),
            settings,
            layout,
            session,
            changes_tx,
            changes_rx,
        })
    }

    pub fn session(&self) -> Arc<RunSession> {
        self.session.clone()
    }

    pub fn layout(&self) -> &CollectionLayout {
        &self.layout
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    /// Run until a termination reason is recorded.
    pub async fn run(self) -> AppResult<Option<TerminationReason>> {
        let Self {
            settings,
            layout,
            session,
            sensors,
            events,
            state,
            changes_tx,
            changes_rx,
        } = self;

        info!(
            deployment = %settings.application.name,
            run_id = %session.run_id(),
            root = %layout.root().display(),
            "Starting collection run"
        );

        spawn_event_log(&events).await;

        let store = JsonlStore::open(layout.logs_dir())
            .await
            .map_err(|e| DaqError::OutputUnwritable(e.to_string()))?;
        let mut scheduler = Scheduler::new(
            settings.acquisition.clone(),
            session.clone(),
            sensors.clone(),
            state.clone(),
            events.clone(),
            Box::new(store),
            changes_rx,
        )
        .with_run_metadata(RunMetadata::new(&settings, session.run_id(), session.start_time()));

        let still = Arc::new(ImageStillEncoder);
        let capture_timeout = Duration::from_millis(settings.acquisition.capture_timeout_ms);

        for camera in &settings.cameras {
            let (Some(images), Some(video)) = (layout.images_dir(&camera.id), layout.video_dir(&camera.id))
            else {
                return Err(DaqError::OutputUnwritable(format!(
                    "No output directory for camera '{}'",
                    camera.id
                )));
            };
            let encoders = Encoders {
                still: still.clone(),
                video: Arc::new(FfmpegVideoEncoder::new(camera.video.encoder_command.clone())),
                hdr: Arc::new(ExternalHdrMerger::new(camera.hdr.merge_command.clone())),
            };
            let pipeline = CameraPipeline::new(
                camera.clone(),
                open_device(camera),
                encoders,
                events.clone(),
                images,
                video,
                capture_timeout,
            );
            info!(camera = %camera.id, label = %camera.label, kind = ?camera.kind, "Camera opened");
            scheduler = scheduler.with_camera(pipeline);
        }

        let watchdog = DiskWatchdog::new(settings.disk.clone(), layout.root(), Arc::new(SysinfoGauge));
        scheduler = scheduler.with_disk_readings(watchdog.readings());
        let watchdog_task = watchdog.spawn(session.clone(), events.clone());

        let controller = match open_controller(&settings, sensors.clone()).await {
            Some((link, controller_events)) => {
                scheduler = scheduler.with_controller(controller_events);
                Some(link)
            }
            None => {
                if settings.acquisition.trigger_source == TriggerSource::Hardware {
                    warn!("Hardware trigger source selected but no controller link is available");
                }
                None
            }
        };

        let server_task = if settings.server.enabled {
            let dispatcher = Dispatcher::new(state.clone(), sensors.clone(), changes_tx, session.clone());
            match ProtocolServer::bind(&settings.server, dispatcher, session.clone()).await {
                Ok(server) => Some(server.spawn()),
                Err(e) => {
                    error!(error = %e, "Protocol server unavailable");
                    None
                }
            }
        } else {
            debug!("Protocol server disabled");
            drop(changes_tx);
            None
        };

        let reason = scheduler.run().await;

        if let Some(link) = controller {
            if let Err(e) = link.send(OutboundFrame::PcState(false)).await {
                debug!(error = %e, "Could not notify controller of shutdown");
            }
            // Give the writer a moment to flush the last line.
            tokio::time::sleep(Duration::from_millis(50)).await;
            link.shutdown();
        }
        watchdog_task.abort();
        if let Some(task) = server_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Protocol server task ended abnormally");
            }
        }

        Ok(reason)
    }
}

/// Connect and configure the controller link when enabled.
async fn open_controller(
    settings: &Settings,
    sensors: Arc<SensorBus>,
) -> Option<(ControllerLink, mpsc::Receiver<ControllerEvent>)> {
    let config = &settings.controller;
    if !config.enabled {
        return None;
    }
    let (mut link, events) = match serial::connect(config, sensors) {
        Ok(pair) => pair,
        Err(e) => {
            error!(port = %config.serial_port, error = %e, "Controller link unavailable");
            return None;
        }
    };
    if let Err(e) = link.setup(config).await {
        error!(error = %e, "Controller setup failed");
        link.shutdown();
        return None;
    }
    if config.ntp_sync_while_deployed {
        link.start_periodic_sync(Duration::from_secs(config.ntp_sync_interval_s.max(1)));
    }
    Some((link, events))
}

/// Log every acquisition event at debug level, and notable ones at info.
async fn spawn_event_log(events: &EventBus) {
    let mut rx = events.subscribe().await;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                AcquisitionEvent::TriggerCompleted { .. } | AcquisitionEvent::BracketCaptured { .. } => {
                    debug!(?event, "Event");
                }
                _ => info!(?event, "Event"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputMode;

    #[test]
    fn test_create_builds_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.application.output_path = dir.path().to_path_buf();
        settings.application.output_mode = OutputMode::Separate;

        let app = App::create(settings).unwrap();
        assert!(app.layout().root().starts_with(dir.path()));
        assert!(app.layout().logs_dir().is_dir());
        assert!(app.layout().images_dir("camera0").unwrap().is_dir());
        assert!(app.session().is_running());
    }

    #[test]
    fn test_create_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.application.output_path = dir.path().to_path_buf();
        settings.acquisition.trigger_rate = 0.0;

        assert!(matches!(App::create(settings), Err(DaqError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_run_to_limit_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.application.output_path = dir.path().to_path_buf();
        settings.acquisition.trigger_rate = 50.0;
        settings.acquisition.trigger_limit = 3;
        settings.server.enabled = false;
        settings.disk.disk_free_min_mb = 0;
        settings.cameras[0].simulation.width = 32;
        settings.cameras[0].simulation.height = 24;

        let app = App::create(settings).unwrap();
        let logs = app.layout().logs_dir().to_path_buf();
        let reason = app.run().await.unwrap();

        assert_eq!(reason, Some(TerminationReason::LimitReached));
        let records = std::fs::read_to_string(logs.join(crate::metadata::RECORD_FILE)).unwrap();
        assert_eq!(records.lines().count(), 3);
        assert!(logs.join(crate::metadata::RUN_FILE).is_file());
    }
}
