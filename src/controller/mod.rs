//! External Controller Link
//!
//! Bidirectional line channel to the deployment controller. The link owns two
//! tasks: a reader that frames and parses inbound lines, watches the
//! heartbeat and turns frames into [`ControllerEvent`]s, and a writer that
//! serializes [`OutboundFrame`]s queued through [`ControllerLink::send`].
//!
//! The link is generic over any `AsyncRead + AsyncWrite` stream. Production
//! code hands it a serial port (see [`serial::connect`]); tests use
//! `tokio::io::duplex`.

pub mod frame;
pub mod serial;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::error::{AppResult, DaqError};
use crate::sensor_bus::SensorBus;

pub use frame::{FrameError, InboundFrame, LineFramer, OutboundFrame, SystemState, MAX_LINE_LEN};

/// Sensor id used for readings relayed by the controller.
pub const CONTROLLER_SENSOR_ID: &str = "controller";

const EVENT_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 32;

/// What the controller told us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Hardware trigger pulse
    TriggerPulse,
    /// System state report
    SystemState(SystemState),
    /// Controller wants the host to stop and power down
    ShutdownRequest,
    /// Heartbeat timeout, EOF or read error
    LinkLost(String),
}

/// Handle to a running controller link.
#[derive(Debug)]
pub struct ControllerLink {
    commands: mpsc::Sender<OutboundFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerLink {
    /// Start reader and writer tasks on `io`.
    ///
    /// Sensor sentences are published straight onto `sensors`; everything
    /// else arrives on the returned receiver.
    pub fn spawn<T>(
        io: T,
        config: &ControllerConfig,
        sensors: Arc<SensorBus>,
    ) -> (Self, mpsc::Receiver<ControllerEvent>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let heartbeat = Duration::from_millis(config.heartbeat_timeout_ms);

        let reader_task = tokio::spawn(read_loop(
            reader,
            heartbeat,
            sensors,
            event_tx,
            command_tx.clone(),
        ));
        let writer_task = tokio::spawn(write_loop(writer, command_rx));

        (
            Self {
                commands: command_tx,
                tasks: vec![reader_task, writer_task],
            },
            event_rx,
        )
    }

    /// Queue a frame for the writer task.
    pub async fn send(&self, frame: OutboundFrame) -> AppResult<()> {
        self.commands
            .send(frame)
            .await
            .map_err(|_| DaqError::SerialPortNotConnected)
    }

    /// Initial handshake: strobe timing, PC ready, state query and the
    /// optional boot-time clock sync.
    pub async fn setup(&self, config: &ControllerConfig) -> AppResult<()> {
        self.send(OutboundFrame::StrobeConfigure {
            prefire_us: config.strobe_pre_fire_us,
            channel: config.strobe_channel,
        })
        .await?;
        self.send(OutboundFrame::PcState(true)).await?;
        self.send(OutboundFrame::GetState).await?;
        if config.ntp_sync_clock_at_boot {
            self.send(OutboundFrame::NtpSync).await?;
        }
        info!(
            prefire_us = config.strobe_pre_fire_us,
            channel = config.strobe_channel,
            "Controller link configured"
        );
        Ok(())
    }

    /// Send `ntpSync` every `interval` for as long as the link lives.
    pub fn start_periodic_sync(&mut self, interval: Duration) {
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; setup already covered boot.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if commands.send(OutboundFrame::NtpSync).await.is_err() {
                    break;
                }
                debug!("Requested controller clock sync");
            }
        });
        self.tasks.push(task);
    }

    /// Stop all link tasks.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    heartbeat: Duration,
    sensors: Arc<SensorBus>,
    events: mpsc::Sender<ControllerEvent>,
    commands: mpsc::Sender<OutboundFrame>,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 512];

    let lost = loop {
        let n = match timeout(heartbeat, reader.read(&mut buf)).await {
            Err(_) => break format!("no data for {} ms", heartbeat.as_millis()),
            Ok(Ok(0)) => break "stream closed".to_string(),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break format!("read error: {}", e),
        };
        framer.extend(&buf[..n]);

        while let Some(line) = framer.next_line() {
            let frame = match InboundFrame::parse(&line) {
                Ok(frame) => frame,
                Err(FrameError::Empty) => continue,
                Err(e) => {
                    debug!(error = %e, "Dropping controller line");
                    continue;
                }
            };
            trace!(?frame, "Controller frame");
            if !handle_frame(frame, &sensors, &events, &commands).await {
                return;
            }
        }
    };

    warn!(reason = %lost, dropped_lines = framer.dropped(), "Controller link lost");
    let _ = events.send(ControllerEvent::LinkLost(lost)).await;
}

/// Returns `false` once nobody listens for events any more.
async fn handle_frame(
    frame: InboundFrame,
    sensors: &SensorBus,
    events: &mpsc::Sender<ControllerEvent>,
    commands: &mpsc::Sender<OutboundFrame>,
) -> bool {
    let event = match frame {
        InboundFrame::Heartbeat => return true,
        InboundFrame::Sensor { header, line } => {
            let reading = sensors.reading(CONTROLLER_SENSOR_ID, header, line);
            sensors.publish(reading).await;
            return true;
        }
        InboundFrame::Trigger => ControllerEvent::TriggerPulse,
        InboundFrame::Shutdown => {
            info!("Controller requested shutdown");
            let _ = commands.send(OutboundFrame::PcState(false)).await;
            ControllerEvent::ShutdownRequest
        }
        InboundFrame::State(state) => {
            info!(state = ?state, code = state.code(), "Controller state");
            if state.requests_shutdown() {
                let _ = commands.send(OutboundFrame::PcState(false)).await;
            }
            ControllerEvent::SystemState(state)
        }
    };
    events.send(event).await.is_ok()
}

async fn write_loop<W>(mut writer: W, mut commands: mpsc::Receiver<OutboundFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = commands.recv().await {
        let line = frame.to_line();
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, frame = %frame, "Controller write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Controller flush failed");
            break;
        }
        trace!(frame = %frame, "Sent controller frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn config(heartbeat_ms: u64) -> ControllerConfig {
        ControllerConfig {
            enabled: true,
            heartbeat_timeout_ms: heartbeat_ms,
            ..ControllerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pulses_and_state_become_events() {
        let (host, mut device) = tokio::io::duplex(1024);
        let bus = Arc::new(SensorBus::new(SensorConfig::default()));
        let (_link, mut events) = ControllerLink::spawn(host, &config(1000), bus);

        device.write_all(b"trigger\ngetState,2\n").await.unwrap();
        assert_eq!(events.recv().await, Some(ControllerEvent::TriggerPulse));
        assert_eq!(
            events.recv().await,
            Some(ControllerEvent::SystemState(SystemState::AtDepth))
        );
    }

    #[tokio::test]
    async fn test_shutdown_state_is_acknowledged() {
        let (host, device) = tokio::io::duplex(1024);
        let (device_rx, mut device_tx) = tokio::io::split(device);
        let bus = Arc::new(SensorBus::new(SensorConfig::default()));
        let (_link, mut events) = ControllerLink::spawn(host, &config(1000), bus);

        device_tx.write_all(b"getState,7\n").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ControllerEvent::SystemState(SystemState::LowBattery))
        );

        let mut lines = BufReader::new(device_rx).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("setPCState,0"));
    }

    #[tokio::test]
    async fn test_sensor_lines_reach_the_bus() {
        let (host, mut device) = tokio::io::duplex(1024);
        let bus = Arc::new(SensorBus::new(SensorConfig::default()));
        let (_link, mut events) = ControllerLink::spawn(host, &config(1000), bus.clone());

        device.write_all(b"$OHPR,12.5,0.3\ntrigger\n").await.unwrap();
        // The trigger is parsed after the sensor line, so the reading is stored by now
        assert_eq!(events.recv().await, Some(ControllerEvent::TriggerPulse));
        let reading = bus.latest(CONTROLLER_SENSOR_ID, "$OHPR").await.unwrap();
        assert_eq!(reading.payload, "$OHPR,12.5,0.3");
    }

    #[tokio::test]
    async fn test_silence_raises_link_lost() {
        let (host, _device) = tokio::io::duplex(64);
        let bus = Arc::new(SensorBus::new(SensorConfig::default()));
        let (_link, mut events) = ControllerLink::spawn(host, &config(30), bus);

        match events.recv().await {
            Some(ControllerEvent::LinkLost(reason)) => {
                assert!(reason.contains("no data"), "unexpected reason: {}", reason)
            }
            other => panic!("expected LinkLost, got {:?}", other),
        }
    }
}
