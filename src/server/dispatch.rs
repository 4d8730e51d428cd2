//! Request handlers.
//!
//! Handlers only read the latest [`StateSnapshot`](crate::state::StateSnapshot)
//! and push changes onto the change queue, so a slow client never holds up a
//! trigger cycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::{
    CameraInfoEntry, CameraInfoList, Envelope, ImageFormat, ImageRequest, JpegImage,
    MessageType, ParameterData, ParameterRequest, RawMatrix, SensorDataList, SensorInfoEntry,
    SensorInfoList, SensorQuery, SensorReadingMsg,
};
use crate::camera::encoder::encode_jpeg;
use crate::camera::transform;
use crate::core::SensorReading;
use crate::error::{ProtocolError, TerminationReason};
use crate::parameter::{self, ParameterUpdate};
use crate::sensor_bus::SensorBus;
use crate::session::RunSession;
use crate::state::{ConfigChange, LatestImage, SharedState};

/// Default image scale percent.
pub const DEFAULT_SCALE: f64 = 100.0;
/// Default JPEG quality.
pub const DEFAULT_JPEG_QUALITY: u32 = 75;

/// Everything a connection needs to answer requests.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<SharedState>,
    sensors: Arc<SensorBus>,
    changes: mpsc::Sender<ConfigChange>,
    session: Arc<RunSession>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<SharedState>,
        sensors: Arc<SensorBus>,
        changes: mpsc::Sender<ConfigChange>,
        session: Arc<RunSession>,
    ) -> Self {
        Self {
            state,
            sensors,
            changes,
            session,
        }
    }

    /// Answer one request. Failures become `ERROR` envelopes.
    pub async fn handle(&self, request: Envelope) -> Vec<Envelope> {
        match self.route(request).await {
            Ok(responses) => responses,
            Err(e) => {
                debug!(error = %e, "Request rejected");
                vec![Envelope::error(&e)]
            }
        }
    }

    async fn route(&self, request: Envelope) -> Result<Vec<Envelope>, ProtocolError> {
        let kind = request.kind()?;
        let response = match kind {
            MessageType::CameraInfo => self.camera_info(),
            MessageType::SensorInfo => self.sensor_info().await,
            MessageType::GetImage => return self.get_image(request.payload()?).await,
            MessageType::GetSensor => self.get_sensor(request.payload()?).await,
            MessageType::SetSensor => self.set_sensor(request.payload()?).await,
            MessageType::GetParameter => self.get_parameter(request.payload()?),
            MessageType::SetParameter => self.set_parameter(request.payload()?).await,
            other => return Err(ProtocolError::UnexpectedType(format!("{:?}", other))),
        };
        Ok(vec![response])
    }

    fn camera_info(&self) -> Envelope {
        let snapshot = self.state.snapshot();
        let cameras = snapshot
            .cameras
            .iter()
            .map(|c| CameraInfoEntry {
                name: c.id.clone(),
                label: c.label.clone(),
                still_enabled: c.still_enabled,
                video_enabled: c.video_enabled,
                hdr_enabled: c.hdr_enabled,
                disabled: snapshot.is_disabled(&c.id),
                trigger_divider: c.trigger_divider,
            })
            .collect();
        Envelope::wrap(MessageType::CameraInfo, &CameraInfoList { cameras })
    }

    async fn sensor_info(&self) -> Envelope {
        let sensors = self
            .sensors
            .all_latest()
            .await
            .into_iter()
            .map(|r| SensorInfoEntry {
                sensor_id: r.sensor_id,
                header: r.header,
                class: r.class.to_string(),
            })
            .collect();
        Envelope::wrap(
            MessageType::SensorInfo,
            &SensorInfoList {
                sensors,
                synchronous_timeout_ms: self.sensors.synchronous_timeout().as_millis() as u64,
            },
        )
    }

    async fn get_image(&self, request: ImageRequest) -> Result<Vec<Envelope>, ProtocolError> {
        if request.cameras.is_empty() {
            return Err(ProtocolError::InvalidRequest("no cameras requested".into()));
        }
        let format = ImageFormat::try_from(request.format)
            .map_err(|_| ProtocolError::InvalidRequest(format!("unknown image format {}", request.format)))?;
        let scale = request.scale.unwrap_or(DEFAULT_SCALE);
        if !(scale > 0.0 && scale <= 100.0) {
            return Err(ProtocolError::InvalidRequest(format!("scale {} outside (0, 100]", scale)));
        }
        let quality = request.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
        if !(1..=100).contains(&quality) {
            return Err(ProtocolError::InvalidRequest(format!("quality {} outside 1-100", quality)));
        }

        let snapshot = self.state.snapshot();
        let mut responses = Vec::with_capacity(request.cameras.len());
        for camera_id in &request.cameras {
            let Some(config) = snapshot.camera(camera_id) else {
                responses.push(Envelope::error(&ProtocolError::InvalidRequest(format!(
                    "unknown camera '{}'",
                    camera_id
                ))));
                continue;
            };
            let Some(image) = snapshot.latest_images.get(camera_id).cloned() else {
                responses.push(Envelope::error(&ProtocolError::InvalidRequest(format!(
                    "no image available yet for camera '{}'",
                    camera_id
                ))));
                continue;
            };
            let label = config.label.clone();
            let response = match format {
                ImageFormat::Jpeg => jpeg_response(camera_id.clone(), label, image, scale, quality).await,
                ImageFormat::RawMatrix => raw_response(camera_id.clone(), label, image, scale).await,
            };
            responses.push(response.unwrap_or_else(|e| Envelope::error(&e)));
        }
        Ok(responses)
    }

    async fn get_sensor(&self, query: SensorQuery) -> Envelope {
        let all = query.sensor_id.is_empty() || query.sensor_id.eq_ignore_ascii_case("none");
        let sensors = self
            .sensors
            .all_latest()
            .await
            .into_iter()
            .filter(|r| all || r.sensor_id == query.sensor_id)
            .filter(|r| query.header.is_empty() || r.header == query.header)
            .map(to_message)
            .collect();
        Envelope::wrap(MessageType::SensorData, &SensorDataList { sensors })
    }

    async fn set_sensor(&self, data: SensorDataList) -> Envelope {
        let mut echoed = Vec::with_capacity(data.sensors.len());
        for msg in data.sensors {
            let mut reading = self.sensors.reading(msg.sensor_id, msg.header, msg.data);
            if let Some(timestamp) = from_epoch_seconds(msg.timestamp) {
                reading.timestamp = timestamp;
            }
            debug!(sensor = %reading.sensor_id, header = %reading.header, "Sensor reading from client");
            echoed.push(to_message(reading.clone()));
            self.sensors.publish(reading).await;
        }
        Envelope::wrap(MessageType::SensorData, &SensorDataList { sensors: echoed })
    }

    fn get_parameter(&self, request: ParameterRequest) -> Envelope {
        let snapshot = self.state.snapshot();
        let reply = match parameter::get(&snapshot, &request.module, &request.parameter) {
            Ok(value) => parameter_reply(request, value, None),
            Err(e) => parameter_reply(request, String::new(), Some(e.to_string())),
        };
        Envelope::wrap(MessageType::ParameterData, &reply)
    }

    async fn set_parameter(&self, request: ParameterRequest) -> Envelope {
        let snapshot = self.state.snapshot();
        let update = parameter::set(&snapshot, &request.module, &request.parameter, &request.value);
        let error = match update {
            Ok(ParameterUpdate::Stop) => {
                info!("Stop requested by client");
                self.session.request_stop(TerminationReason::Operator);
                None
            }
            Ok(ParameterUpdate::Change(change)) => match self.changes.send(change).await {
                Ok(()) => None,
                Err(_) => Some("acquisition is not accepting changes".to_string()),
            },
            Err(e) => Some(e.to_string()),
        };
        let value = request.value.clone();
        Envelope::wrap(MessageType::ParameterData, &parameter_reply(request, value, error))
    }
}

fn parameter_reply(request: ParameterRequest, value: String, error: Option<String>) -> ParameterData {
    ParameterData {
        module: request.module,
        parameter: request.parameter,
        value,
        ok: error.is_none(),
        error_string: error.unwrap_or_default(),
    }
}

fn to_message(reading: SensorReading) -> SensorReadingMsg {
    SensorReadingMsg {
        sensor_id: reading.sensor_id,
        header: reading.header,
        timestamp: epoch_seconds(reading.timestamp),
        data: reading.payload,
    }
}

fn epoch_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 / 1e6
}

fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1e6) as i64)
}

fn file_name(image: &LatestImage) -> String {
    image
        .filename
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn jpeg_response(
    camera: String,
    label: String,
    image: LatestImage,
    scale: f64,
    quality: u32,
) -> Result<Envelope, ProtocolError> {
    let filename = file_name(&image);
    let source = image.frame.clone();
    let (frame, jpg_data) = tokio::task::spawn_blocking(move || {
        let frame = transform::scale(&source, scale);
        let data = encode_jpeg(&frame, quality as u8);
        (frame, data)
    })
    .await
    .map_err(|e| ProtocolError::InvalidRequest(format!("image encoding aborted: {}", e)))?;
    let jpg_data = jpg_data.map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?;

    Ok(Envelope::wrap(
        MessageType::JpegData,
        &JpegImage {
            camera,
            image_number: image.sequence_number,
            timestamp: epoch_seconds(image.timestamp),
            width: frame.width,
            height: frame.height,
            exposure_us: image.exposure_us,
            gain: image.gain,
            filename,
            label,
            jpg_data,
        },
    ))
}

async fn raw_response(
    camera: String,
    label: String,
    image: LatestImage,
    scale: f64,
) -> Result<Envelope, ProtocolError> {
    let filename = file_name(&image);
    let source = image.frame.clone();
    let frame = if scale == DEFAULT_SCALE {
        source
    } else {
        tokio::task::spawn_blocking(move || transform::scale(&source, scale))
            .await
            .map_err(|e| ProtocolError::InvalidRequest(format!("image scaling aborted: {}", e)))?
    };

    Ok(Envelope::wrap(
        MessageType::RawMatrixData,
        &RawMatrix {
            camera,
            image_number: image.sequence_number,
            timestamp: epoch_seconds(image.timestamp),
            rows: frame.height,
            cols: frame.width,
            channels: frame.channels as u32,
            elt_size: 1,
            exposure_us: image.exposure_us,
            gain: image.gain,
            filename,
            label,
            mat_data: frame.pixels.to_vec(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, SensorConfig};
    use crate::core::Frame;
    use crate::state::{change_queue, StateSnapshot};

    fn sensor_msg(sensor_id: &str, header: &str, data: &str) -> SensorReadingMsg {
        SensorReadingMsg {
            sensor_id: sensor_id.into(),
            header: header.into(),
            timestamp: 0.0,
            data: data.into(),
        }
    }

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<ConfigChange>, Arc<SharedState>) {
        let state = Arc::new(SharedState::new(StateSnapshot {
            cameras: vec![CameraConfig::new("port")],
            trigger_rate: 5.0,
            ..StateSnapshot::default()
        }));
        let sensors = Arc::new(SensorBus::new(SensorConfig::default()));
        let session = Arc::new(RunSession::new("/tmp", None));
        let (tx, rx) = change_queue(8);
        (Dispatcher::new(state.clone(), sensors, tx, session), rx, state)
    }

    fn store_image(state: &SharedState) {
        state.update(|s| {
            s.latest_images.insert(
                "port".into(),
                LatestImage {
                    sequence_number: 7,
                    timestamp: Utc::now(),
                    exposure_us: 4000,
                    gain: 18.0,
                    filename: None,
                    frame: Frame::new(8, 4, 1, vec![128u8; 32]).unwrap(),
                },
            );
        });
    }

    #[tokio::test]
    async fn test_camera_info_lists_cameras() {
        let (d, _rx, _) = dispatcher();
        let responses = d.handle(Envelope::empty(MessageType::CameraInfo)).await;
        let list: CameraInfoList = responses[0].payload().unwrap();
        assert_eq!(list.cameras.len(), 1);
        assert_eq!(list.cameras[0].name, "port");
    }

    #[tokio::test]
    async fn test_raw_image_with_defaults() {
        let (d, _rx, state) = dispatcher();
        store_image(&state);
        let request = ImageRequest {
            cameras: vec!["port".into()],
            format: ImageFormat::RawMatrix as i32,
            ..ImageRequest::default()
        };
        let responses = d.handle(Envelope::wrap(MessageType::GetImage, &request)).await;
        assert_eq!(responses[0].kind().unwrap(), MessageType::RawMatrixData);
        let raw: RawMatrix = responses[0].payload().unwrap();
        assert_eq!((raw.rows, raw.cols, raw.channels, raw.elt_size), (4, 8, 1, 1));
        assert_eq!(raw.image_number, 7);
        assert_eq!(raw.mat_data.len(), 32);
    }

    #[tokio::test]
    async fn test_jpeg_image_is_scaled() {
        let (d, _rx, state) = dispatcher();
        store_image(&state);
        let request = ImageRequest {
            cameras: vec!["port".into()],
            format: ImageFormat::Jpeg as i32,
            scale: Some(50.0),
            quality: None,
        };
        let responses = d.handle(Envelope::wrap(MessageType::GetImage, &request)).await;
        let jpeg: JpegImage = responses[0].payload().unwrap();
        assert_eq!((jpeg.width, jpeg.height), (4, 2));
        assert_eq!(&jpeg.jpg_data[..2], &[0xFF, 0xD8], "JPEG SOI marker");
    }

    #[tokio::test]
    async fn test_unknown_camera_and_missing_image_are_errors() {
        let (d, _rx, _) = dispatcher();
        let request = ImageRequest {
            cameras: vec!["port".into(), "bow".into()],
            ..ImageRequest::default()
        };
        let responses = d.handle(Envelope::wrap(MessageType::GetImage, &request)).await;
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.kind().unwrap() == MessageType::Error));
    }

    #[tokio::test]
    async fn test_set_sensor_publishes_and_echoes() {
        let (d, _rx, _) = dispatcher();
        let data = SensorDataList {
            sensors: vec![sensor_msg("gps", "$GPGGA", "$GPGGA,1,2")],
        };
        let responses = d.handle(Envelope::wrap(MessageType::SetSensor, &data)).await;
        let echo: SensorDataList = responses[0].payload().unwrap();
        assert_eq!(echo.sensors[0].data, "$GPGGA,1,2");

        let query = SensorQuery {
            sensor_id: "None".into(),
            header: String::new(),
        };
        let responses = d.handle(Envelope::wrap(MessageType::GetSensor, &query)).await;
        let list: SensorDataList = responses[0].payload().unwrap();
        assert_eq!(list.sensors.len(), 1);
        assert_eq!(list.sensors[0].sensor_id, "gps");
    }

    #[tokio::test]
    async fn test_set_parameter_queues_change() {
        let (d, mut rx, _) = dispatcher();
        let request = ParameterRequest {
            module: "port".into(),
            parameter: "gain".into(),
            value: "3".into(),
        };
        let responses = d.handle(Envelope::wrap(MessageType::SetParameter, &request)).await;
        let reply: ParameterData = responses[0].payload().unwrap();
        assert!(reply.ok, "error: {}", reply.error_string);
        assert!(reply.error_string.is_empty());
        assert!(matches!(rx.try_recv(), Ok(ConfigChange::Camera { .. })));
    }

    #[tokio::test]
    async fn test_bad_parameter_reports_error_string() {
        let (d, mut rx, _) = dispatcher();
        let request = ParameterRequest {
            module: "port".into(),
            parameter: "gain".into(),
            value: "loud".into(),
        };
        let responses = d.handle(Envelope::wrap(MessageType::SetParameter, &request)).await;
        let reply: ParameterData = responses[0].payload().unwrap();
        assert!(!reply.ok);
        assert!(!reply.error_string.is_empty());
        assert!(rx.try_recv().is_err(), "nothing should be queued");
    }

    #[tokio::test]
    async fn test_response_types_are_not_requests() {
        let (d, _rx, _) = dispatcher();
        let responses = d.handle(Envelope::empty(MessageType::JpegData)).await;
        assert_eq!(responses[0].kind().unwrap(), MessageType::Error);
    }
}
