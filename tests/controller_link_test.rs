//! Controller link driving a hardware-triggered run over an in-memory stream.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use trawl_daq::camera::encoder::{
    HdrMergeRequest, HdrMerger, StillEncoder, VideoEncoder, VideoGeometry, VideoWriter,
};
use trawl_daq::camera::{CameraPipeline, Encoders, SimulatedCamera};
use trawl_daq::config::{
    AcquisitionConfig, CameraConfig, ControllerConfig, SensorConfig, StillConfig, TriggerSource,
    VideoConfig,
};
use trawl_daq::controller::{ControllerLink, OutboundFrame, CONTROLLER_SENSOR_ID};
use trawl_daq::core::Frame;
use trawl_daq::error::{EncodeError, TerminationReason};
use trawl_daq::events::EventBus;
use trawl_daq::metadata::MemoryStore;
use trawl_daq::scheduler::Scheduler;
use trawl_daq::sensor_bus::SensorBus;
use trawl_daq::session::RunSession;
use trawl_daq::state::{change_queue, SharedState, StateSnapshot};

struct Discard;

#[async_trait]
impl StillEncoder for Discard {
    async fn encode(&self, _frame: &Frame, _path: &Path, _options: &StillConfig) -> Result<(), EncodeError> {
        Ok(())
    }
}

#[async_trait]
impl VideoEncoder for Discard {
    async fn open(
        &self,
        _path: &Path,
        _geometry: VideoGeometry,
        _profile: &VideoConfig,
    ) -> Result<Box<dyn VideoWriter>, EncodeError> {
        Err(EncodeError::Unavailable("no video in this test".into()))
    }
}

#[async_trait]
impl HdrMerger for Discard {
    async fn merge(&self, request: HdrMergeRequest) -> Result<std::path::PathBuf, EncodeError> {
        Ok(request.output)
    }
}

fn controller_config() -> ControllerConfig {
    ControllerConfig {
        enabled: true,
        strobe_pre_fire_us: 150,
        strobe_channel: 2,
        heartbeat_timeout_ms: 2000,
        ntp_sync_clock_at_boot: true,
        ..ControllerConfig::default()
    }
}

#[tokio::test]
async fn test_setup_handshake_lines() {
    let (host, device) = tokio::io::duplex(1024);
    let bus = Arc::new(SensorBus::new(SensorConfig::default()));
    let config = controller_config();
    let (link, _events) = ControllerLink::spawn(host, &config, bus);

    link.setup(&config).await.unwrap();

    let mut lines = BufReader::new(device).lines();
    let mut sent = Vec::new();
    for _ in 0..4 {
        sent.push(lines.next_line().await.unwrap().unwrap());
    }
    assert_eq!(sent, vec!["strobe,150,2", "setPCState,1", "getState", "ntpSync"]);

    link.send(OutboundFrame::PcState(false)).await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("setPCState,0"));
    link.shutdown();
}

#[tokio::test]
async fn test_hardware_run_follows_controller() {
    let dir = tempfile::tempdir().unwrap();
    let (host, device) = tokio::io::duplex(4096);
    let (device_rx, mut device_tx) = tokio::io::split(device);

    let acquisition = AcquisitionConfig {
        trigger_rate: 1.0,
        trigger_limit: -1,
        trigger_source: TriggerSource::Hardware,
        capture_timeout_ms: 500,
        ..AcquisitionConfig::default()
    };
    let sensors = Arc::new(SensorBus::new(SensorConfig {
        synchronous: vec!["$OHPR".into()],
        synchronous_timeout_ms: 1000,
        ..SensorConfig::default()
    }));
    let session = Arc::new(RunSession::new(dir.path(), None));
    let events = Arc::new(EventBus::default());
    let store = MemoryStore::new();
    let (_changes, changes_rx) = change_queue(4);

    let config = controller_config();
    let (link, controller_events) = ControllerLink::spawn(host, &config, sensors.clone());
    link.setup(&config).await.unwrap();

    let device_camera = Arc::new(SimulatedCamera::new("port", 16, 12));
    let encoders = Encoders {
        still: Arc::new(Discard),
        video: Arc::new(Discard),
        hdr: Arc::new(Discard),
    };
    let pipeline = CameraPipeline::new(
        CameraConfig {
            exposure_us: 500,
            ..CameraConfig::new("port")
        },
        device_camera.clone(),
        encoders,
        events.clone(),
        dir.path(),
        dir.path(),
        Duration::from_millis(500),
    );

    let scheduler = Scheduler::new(
        acquisition,
        session.clone(),
        sensors.clone(),
        Arc::new(SharedState::new(StateSnapshot::default())),
        events,
        Box::new(store.clone()),
        changes_rx,
    )
    .with_camera(pipeline)
    .with_controller(controller_events);
    let run = tokio::spawn(scheduler.run());

    // Deployed, then each pulse is preceded by the synchronous sentence it
    // should be paired with
    device_tx.write_all(b"getState,2\n").await.unwrap();
    for i in 0..3 {
        let line = format!("$OHPR,{}.0,0.5\ntrigger\n", i);
        device_tx.write_all(line.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    device_tx.write_all(b"getState,4\n").await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, Some(TerminationReason::ControllerShutdown));

    let records = store.records().await;
    assert_eq!(records.len(), 3);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.sequence_number(), i as u64);
        assert!(record.sensors.complete);
        let ohpr = record
            .sensors
            .readings
            .iter()
            .find(|r| r.sensor_id == CONTROLLER_SENSOR_ID && r.header == "$OHPR")
            .unwrap();
        assert_eq!(ohpr.payload, format!("$OHPR,{}.0,0.5", i));
    }
    assert_eq!(device_camera.frame_count().await, 3);

    // Handshake, then the acknowledgement of the shutdown state
    let mut lines = BufReader::new(device_rx).lines();
    let mut sent = Vec::new();
    while sent.last().map(String::as_str) != Some("setPCState,0") {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        sent.push(line);
    }
    assert_eq!(sent[..3], ["strobe,150,2", "setPCState,1", "getState"]);
    link.shutdown();
}
