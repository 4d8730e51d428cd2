//! Trigger Scheduler
//!
//! The Scheduler owns the run loop. Each cycle it:
//!
//! 1. applies configuration changes queued since the last cycle
//! 2. creates the [`TriggerEvent`] with the next sequence number
//! 3. launches every active camera's pipeline on its own task, together with
//!    a Sensor Bus snapshot
//! 4. joins everything against a deadline of `synchronous_timeout`
//! 5. assembles the [`AcquisitionRecord`] and hands it to the metadata store,
//!    the shared state and the event bus
//!
//! In software mode cycles fire on a steady clock at `origin + n * period`;
//! missed deadlines are skipped rather than bunched. In hardware mode each
//! controller pulse is one cycle and the rate only paces a heartbeat log.
//!
//! With a controller attached, nothing fires until the controller reports a
//! deployment state (at depth, pressure switch closed, or forced on when
//! `always_trigger_at_start` is set). Forced on alone is download mode.
//!
//! One camera's failure never aborts the cycle for the others. A camera that
//! fails `max_consecutive_failures` cycles in a row is disabled for the rest
//! of the run. Cameras whose previous capture is still running, or that miss
//! the join deadline, are reported `busy`.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::camera::{CameraPipeline, CycleOutcome, CyclePlan};
use crate::config::{AcquisitionConfig, CameraConfig, TriggerSource};
use crate::controller::{ControllerEvent, SystemState};
use crate::core::{AcquisitionRecord, CaptureStatus, CaptureSummary, TriggerEvent};
use crate::error::TerminationReason;
use crate::events::{AcquisitionEvent, EventBus};
use crate::metadata::{MetadataStore, RunMetadata};
use crate::sensor_bus::SensorBus;
use crate::session::RunSession;
use crate::state::{ConfigChange, LatestImage, SharedState};

/// One camera as seen by the Scheduler.
struct CameraSlot {
    /// Effective configuration; the pipeline catches up when it is free
    config: CameraConfig,
    pipeline: Arc<Mutex<CameraPipeline>>,
    config_pending: bool,
    /// Pending change needs `CameraDevice::configure`
    device_pending: bool,
    failures: u32,
    disabled: bool,
}

enum Joined {
    Done(CycleOutcome),
    Panicked(String),
    Late,
}

/// Orchestrator of trigger cycles.
pub struct Scheduler {
    acquisition: AcquisitionConfig,
    cameras: Vec<CameraSlot>,
    sensors: Arc<SensorBus>,
    session: Arc<RunSession>,
    state: Arc<SharedState>,
    events: Arc<EventBus>,
    store: Box<dyn MetadataStore>,
    changes: mpsc::Receiver<ConfigChange>,
    controller: Option<mpsc::Receiver<ControllerEvent>>,
    disk_free: Option<watch::Receiver<Option<u64>>>,
    run_metadata: Option<RunMetadata>,
    /// Triggering allowed; set at start without a controller
    armed: bool,
}

/// Stands in for a deadline that can not be represented.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

impl Scheduler {
    pub fn new(
        acquisition: AcquisitionConfig,
        session: Arc<RunSession>,
        sensors: Arc<SensorBus>,
        state: Arc<SharedState>,
        events: Arc<EventBus>,
        store: Box<dyn MetadataStore>,
        changes: mpsc::Receiver<ConfigChange>,
    ) -> Self {
        Self {
            acquisition,
            cameras: Vec::new(),
            sensors,
            session,
            state,
            events,
            store,
            changes,
            controller: None,
            disk_free: None,
            run_metadata: None,
            armed: false,
        }
    }

    /// Add a camera. Cameras are reported in the order they are added.
    pub fn with_camera(mut self, pipeline: CameraPipeline) -> Self {
        self.cameras.push(CameraSlot {
            config: pipeline.config().clone(),
            pipeline: Arc::new(Mutex::new(pipeline)),
            config_pending: false,
            device_pending: false,
            failures: 0,
            disabled: false,
        });
        self
    }

    /// Events from the controller link.
    pub fn with_controller(mut self, events: mpsc::Receiver<ControllerEvent>) -> Self {
        self.controller = Some(events);
        self
    }

    /// Free-space readings from the disk watchdog.
    pub fn with_disk_readings(mut self, readings: watch::Receiver<Option<u64>>) -> Self {
        self.disk_free = Some(readings);
        self
    }

    /// Run description written at start and rewritten at stop.
    pub fn with_run_metadata(mut self, metadata: RunMetadata) -> Self {
        self.run_metadata = Some(metadata);
        self
    }

    pub fn session(&self) -> Arc<RunSession> {
        self.session.clone()
    }

    /// Operator stop.
    pub fn stop(&self) {
        self.session.request_stop(TerminationReason::Operator);
    }

    /// Run until the session stops. Returns the termination reason.
    pub async fn run(mut self) -> Option<TerminationReason> {
        self.publish_initial_state();
        if let Some(meta) = self.run_metadata.clone() {
            if let Err(e) = self.store.write_run_metadata(&meta).await {
                error!(error = %e, "Could not write run metadata");
                self.session.request_stop(TerminationReason::OutputUnwritable);
            }
        }

        info!(
            cameras = self.cameras.len(),
            rate_hz = self.acquisition.trigger_rate,
            limit = self.acquisition.trigger_limit,
            source = ?self.acquisition.trigger_source,
            "Acquisition started"
        );

        if self.session.limit_reached() {
            self.session.request_stop(TerminationReason::LimitReached);
        }
        self.armed = self.controller.is_none();

        match self.acquisition.trigger_source {
            TriggerSource::Software => self.run_software().await,
            TriggerSource::Hardware => self.run_hardware().await,
        }

        self.finish().await
    }

    async fn run_software(&mut self) {
        if !self.wait_until_armed().await {
            return;
        }
        if self.acquisition.always_trigger_at_start && self.session.is_running() {
            self.cycle(TriggerSource::Software).await;
        }

        let mut origin = Instant::now();
        let mut period = self.acquisition.period();
        let mut n: u64 = 0;

        while self.session.is_running() {
            n = n.saturating_add(1);
            let mut deadline = trigger_deadline(origin, period, n);
            let now = Instant::now();
            if deadline < now {
                let elapsed = (now - origin).as_nanos() / period.as_nanos().max(1);
                let next = u64::try_from(elapsed).unwrap_or(u64::MAX).saturating_add(1);
                debug!(skipped = next.saturating_sub(n), "Missed trigger deadlines");
                n = next;
                deadline = trigger_deadline(origin, period, n);
            }

            loop {
                tokio::select! {
                    _ = self.session.stop_requested() => return,
                    event = next_event(&mut self.controller) => {
                        self.on_controller_event(event).await;
                    }
                    _ = sleep_until(deadline) => break,
                }
            }

            if !self.session.is_running() {
                break;
            }
            self.cycle(TriggerSource::Software).await;

            let rate_period = self.acquisition.period();
            if rate_period != period {
                info!(rate_hz = self.acquisition.trigger_rate, "Trigger rate changed");
                period = rate_period;
                origin = Instant::now();
                n = 0;
            }
        }
    }

    async fn run_hardware(&mut self) {
        if self.controller.is_none() {
            error!("Hardware triggering needs the controller link");
            self.session.request_stop(TerminationReason::ConfigurationError);
            return;
        }
        if !self.wait_until_armed().await {
            return;
        }
        if self.acquisition.always_trigger_at_start && self.session.is_running() {
            self.cycle(TriggerSource::Hardware).await;
        }

        let mut heartbeat = tokio::time::interval(self.acquisition.period());
        heartbeat.tick().await;
        let mut pulses: u64 = 0;

        while self.session.is_running() {
            tokio::select! {
                _ = self.session.stop_requested() => break,
                event = next_event(&mut self.controller) => match event {
                    Some(ControllerEvent::TriggerPulse) => {
                        pulses += 1;
                        self.on_controller_pulse().await;
                    }
                    other => self.on_controller_event(other).await,
                },
                _ = heartbeat.tick() => {
                    info!(pulses, count = self.session.trigger_count(), "Hardware trigger heartbeat");
                    pulses = 0;
                }
            }
        }
    }

    /// Hold triggering until the controller reports a deployment state.
    /// Returns `false` if the run stopped first.
    async fn wait_until_armed(&mut self) -> bool {
        if !self.armed {
            info!("Waiting for the controller to report deployment before triggering");
        }
        while !self.armed {
            tokio::select! {
                _ = self.session.stop_requested() => return false,
                event = next_event(&mut self.controller) => {
                    self.on_controller_event(event).await;
                }
            }
        }
        self.session.is_running()
    }

    /// One hardware-triggered cycle.
    async fn on_controller_pulse(&mut self) {
        if self.session.is_running() {
            self.cycle(TriggerSource::Hardware).await;
        }
    }

    async fn on_controller_event(&mut self, event: Option<ControllerEvent>) {
        let hardware = self.acquisition.trigger_source == TriggerSource::Hardware;
        match event {
            Some(ControllerEvent::TriggerPulse) if hardware => {
                debug!("Ignoring controller pulse before deployment");
            }
            Some(ControllerEvent::TriggerPulse) => {
                debug!("Ignoring controller pulse in software trigger mode");
            }
            Some(ControllerEvent::SystemState(state)) => {
                self.events
                    .publish(AcquisitionEvent::ControllerState { state })
                    .await;
                if state.requests_shutdown() {
                    self.session.request_stop(TerminationReason::ControllerShutdown);
                } else if !self.armed {
                    self.arm_on(state);
                }
            }
            Some(ControllerEvent::ShutdownRequest) => {
                self.session.request_stop(TerminationReason::ControllerShutdown);
            }
            Some(ControllerEvent::LinkLost(reason)) => {
                self.controller = None;
                if hardware {
                    error!(%reason, "Controller link lost in hardware trigger mode");
                    self.session.request_stop(TerminationReason::ControllerLinkLost);
                } else {
                    warn!(%reason, "Controller link lost, continuing on software trigger");
                    self.armed = true;
                }
            }
            None => {
                self.controller = None;
                if hardware {
                    error!("Controller link closed in hardware trigger mode");
                    self.session.request_stop(TerminationReason::ControllerLinkLost);
                } else {
                    self.armed = true;
                }
            }
        }
    }

    fn arm_on(&mut self, state: SystemState) {
        let forced = self.acquisition.always_trigger_at_start;
        if state.starts_acquisition(forced) {
            info!(?state, "Controller reports deployment, starting triggering");
            self.armed = true;
        } else if state == SystemState::ForcedOn {
            info!("Controller forced on, operating in download mode without triggering");
        } else {
            debug!(?state, "Controller not deployed yet");
        }
    }

    fn publish_initial_state(&self) {
        let cameras = self.cameras.iter().map(|s| s.config.clone()).collect();
        let acquisition = &self.acquisition;
        let status = self.session.status();
        self.state.update(|s| {
            s.cameras = cameras;
            s.trigger_rate = acquisition.trigger_rate;
            s.trigger_limit = acquisition.trigger_limit;
            s.status = Some(status);
        });
    }

    /// Apply queued changes to the Scheduler's view of the config.
    fn drain_changes(&mut self) {
        let mut changed = false;
        while let Ok(change) = self.changes.try_recv() {
            match change {
                ConfigChange::TriggerRate(rate) => match AcquisitionConfig::check_trigger_rate(rate) {
                    Ok(rate) => {
                        self.acquisition.trigger_rate = rate;
                        changed = true;
                    }
                    Err(e) => warn!(error = %e, "Rejected trigger rate change"),
                },
                ConfigChange::Camera { camera_id, setting } => {
                    let Some(slot) = self.cameras.iter_mut().find(|s| s.config.id == camera_id) else {
                        warn!(camera = %camera_id, "Change for unknown camera dropped");
                        continue;
                    };
                    let mut updated = slot.config.clone();
                    setting.apply(&mut updated);
                    if let Err(e) = updated.validate() {
                        warn!(camera = %camera_id, error = %e, "Rejected camera change");
                        continue;
                    }
                    debug!(camera = %camera_id, ?setting, "Camera change applied");
                    slot.config = updated;
                    slot.config_pending = true;
                    slot.device_pending |= setting.touches_device();
                    changed = true;
                }
            }
        }

        if changed {
            let cameras: Vec<CameraConfig> = self.cameras.iter().map(|s| s.config.clone()).collect();
            let rate = self.acquisition.trigger_rate;
            self.state.update(|s| {
                s.cameras = cameras;
                s.trigger_rate = rate;
            });
        }
    }

    /// Push pending configs into pipelines that are not busy.
    async fn sync_pipelines(&mut self) {
        for slot in self.cameras.iter_mut().filter(|s| s.config_pending && !s.disabled) {
            let Ok(mut pipeline) = slot.pipeline.clone().try_lock_owned() else {
                continue;
            };
            match pipeline.apply_config(slot.config.clone(), slot.device_pending).await {
                Ok(()) => {
                    slot.config_pending = false;
                    slot.device_pending = false;
                }
                Err(e) => {
                    warn!(camera = %slot.config.id, error = %e, "Could not reconfigure camera");
                }
            }
        }
    }

    async fn cycle(&mut self, source: TriggerSource) {
        self.drain_changes();
        self.sync_pipelines().await;

        let seq = self.session.trigger_count();
        let trigger = Arc::new(TriggerEvent::new(seq, source));
        let deadline = trigger.instant + self.sensors.synchronous_timeout();

        let mut summaries: Vec<Option<CaptureSummary>> = Vec::with_capacity(self.cameras.len());
        let mut launched = Vec::new();
        let mut active = 0;

        for (slot_index, slot) in self.cameras.iter().enumerate() {
            if slot.disabled {
                summaries.push(Some(CaptureSummary::absent(&slot.config.id, CaptureStatus::Disabled)));
                continue;
            }
            let Some(plan) = CyclePlan::for_sequence(&slot.config, seq) else {
                summaries.push(None);
                continue;
            };
            active += 1;
            match slot.pipeline.clone().try_lock_owned() {
                Ok(mut pipeline) => {
                    let trigger = trigger.clone();
                    let handle = tokio::spawn(async move { pipeline.run_cycle(trigger, plan).await });
                    launched.push((slot_index, slot.config.id.clone(), handle));
                    summaries.push(None);
                }
                Err(_) => {
                    debug!(camera = %slot.config.id, seq, "Camera still busy");
                    summaries.push(Some(CaptureSummary::absent(&slot.config.id, CaptureStatus::Busy)));
                }
            }
        }

        let joins = join_all(launched.into_iter().map(|(slot_index, camera_id, mut handle)| async move {
            let joined = match timeout_at(deadline, &mut handle).await {
                Ok(Ok(outcome)) => Joined::Done(outcome),
                Ok(Err(e)) => Joined::Panicked(e.to_string()),
                Err(_) => {
                    warn!(camera = %camera_id, seq, "Camera missed the cycle deadline");
                    let late_id = camera_id.clone();
                    tokio::spawn(async move {
                        if let Ok(outcome) = handle.await {
                            debug!(camera = %late_id, seq, status = ?outcome.summary.status, "Dropping late capture result");
                        }
                    });
                    Joined::Late
                }
            };
            (slot_index, camera_id, joined)
        }));
        let (sensors, joined) = tokio::join!(self.sensors.snapshot(deadline), joins);

        let mut previews = Vec::new();
        for (slot_index, camera_id, joined) in joined {
            let summary = match joined {
                Joined::Done(outcome) => {
                    self.account(slot_index, outcome.error.is_some()).await;
                    if let (Some(frame), Some(first)) = (outcome.preview, outcome.summary.brackets.first()) {
                        previews.push((
                            camera_id,
                            LatestImage {
                                sequence_number: seq,
                                timestamp: trigger.timestamp,
                                exposure_us: first.exposure_us,
                                gain: first.gain,
                                filename: first.still_path.clone(),
                                frame,
                            },
                        ));
                    }
                    outcome.summary
                }
                Joined::Panicked(message) => {
                    error!(camera = %camera_id, seq, %message, "Camera task panicked");
                    self.account(slot_index, true).await;
                    CaptureSummary::absent(
                        &camera_id,
                        CaptureStatus::Failed {
                            code: "device-error".to_string(),
                            message,
                        },
                    )
                }
                Joined::Late => CaptureSummary::absent(&camera_id, CaptureStatus::Busy),
            };
            summaries[slot_index] = Some(summary);
        }

        let disk_free_mb = self.disk_free.as_ref().and_then(|rx| *rx.borrow());
        let record = Arc::new(AcquisitionRecord {
            trigger: trigger.clone(),
            cameras: summaries.into_iter().flatten().collect(),
            sensors,
            disk_free_mb,
        });
        let captured = record.cameras.iter().filter(|c| c.is_captured()).count();
        let complete = record.is_complete();

        if let Err(e) = self.store.write_record(&record).await {
            error!(seq, error = %e, "Could not persist acquisition record");
            self.session.request_stop(TerminationReason::OutputUnwritable);
        }

        let count = self.session.record_trigger();
        let status = self.session.status();
        let disabled: Vec<String> = self
            .cameras
            .iter()
            .filter(|s| s.disabled)
            .map(|s| s.config.id.clone())
            .collect();
        self.state.update(|s| {
            s.trigger_count = count;
            s.status = Some(status);
            s.disabled_cameras = disabled;
            s.disk_free_mb = disk_free_mb;
            s.latest_images.extend(previews);
            s.latest_record = Some(record);
        });

        self.events
            .publish(AcquisitionEvent::TriggerCompleted {
                sequence_number: seq,
                complete,
                cameras_captured: captured,
                cameras_active: active,
            })
            .await;

        if complete {
            debug!(seq, captured, "Trigger complete");
        } else {
            info!(seq, captured, active, "Trigger partial");
        }

        if self.session.limit_reached() {
            info!(count, "Trigger limit reached");
            self.session.request_stop(TerminationReason::LimitReached);
        }
    }

    /// Track consecutive failures; disable the camera at the threshold.
    async fn account(&mut self, slot_index: usize, failed: bool) {
        let max = self.acquisition.max_consecutive_failures.max(1);
        let Some(slot) = self.cameras.get_mut(slot_index) else {
            return;
        };
        if !failed {
            slot.failures = 0;
            return;
        }
        slot.failures += 1;
        if slot.failures >= max && !slot.disabled {
            slot.disabled = true;
            error!(
                camera = %slot.config.id,
                failures = slot.failures,
                "Camera disabled after consecutive failures"
            );
            let event = AcquisitionEvent::CameraDisabled {
                camera_id: slot.config.id.clone(),
                failures: slot.failures,
            };
            self.events.publish(event).await;
        }
    }

    /// Close pipelines, persist the run metadata and mark the session stopped.
    async fn finish(mut self) -> Option<TerminationReason> {
        let shutdown = Duration::from_millis(self.acquisition.shutdown_timeout_ms);
        let deadline = Instant::now() + shutdown;

        let closes = self.cameras.iter().map(|slot| {
            let pipeline = slot.pipeline.clone();
            let camera_id = slot.config.id.clone();
            async move {
                let closed = timeout_at(deadline, async {
                    let mut pipeline = pipeline.lock().await;
                    pipeline.close().await
                })
                .await;
                match closed {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(camera = %camera_id, error = %e, "Pipeline close reported an error"),
                    Err(_) => warn!(
                        camera = %camera_id,
                        timeout_ms = shutdown.as_millis() as u64,
                        "Pipeline did not close in time, abandoning it"
                    ),
                }
            }
        });
        join_all(closes).await;

        let reason = self.session.termination_reason();
        let count = self.session.trigger_count();

        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Metadata flush failed");
        }
        if let Some(mut meta) = self.run_metadata.take() {
            meta.finish(count, reason);
            if let Err(e) = self.store.write_run_metadata(&meta).await {
                warn!(error = %e, "Could not write final run metadata");
            }
        }

        self.session.mark_stopped();
        let status = self.session.status();
        self.state.update(|s| s.status = Some(status));
        self.events
            .publish(AcquisitionEvent::SessionStopped { reason })
            .await;

        match reason {
            Some(reason) => info!(
                reason = reason.tag(),
                exit_code = reason.exit_code(),
                triggers = count,
                "Acquisition stopped"
            ),
            None => info!(triggers = count, "Acquisition stopped"),
        }
        reason
    }
}

/// `origin + n * period`, or [`FAR_FUTURE`] past `origin` when that overflows.
fn trigger_deadline(origin: Instant, period: Duration, n: u64) -> Instant {
    period
        .as_nanos()
        .checked_mul(u128::from(n))
        .and_then(|nanos| u64::try_from(nanos).ok())
        .and_then(|nanos| origin.checked_add(Duration::from_nanos(nanos)))
        .unwrap_or_else(|| origin + FAR_FUTURE)
}

async fn next_event(rx: &mut Option<mpsc::Receiver<ControllerEvent>>) -> Option<ControllerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_deadline_is_exact_multiple() {
        let origin = Instant::now();
        let period = Duration::from_millis(100);
        assert_eq!(trigger_deadline(origin, period, 0), origin);
        assert_eq!(trigger_deadline(origin, period, 7), origin + Duration::from_millis(700));
    }

    #[test]
    fn test_trigger_deadline_saturates() {
        let origin = Instant::now();
        let far = trigger_deadline(origin, Duration::from_secs(86_400), u64::MAX);
        assert_eq!(far, origin + FAR_FUTURE);
    }
}
