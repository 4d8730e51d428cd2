//! Wire messages of the control/query protocol.
//!
//! Every frame body is an [`Envelope`]; its `data` field holds the payload
//! message selected by `type`. Messages are declared with `prost` derives so
//! no build step is needed.

use prost::Message;

use crate::error::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Error = 0,
    CameraInfo = 1,
    SensorInfo = 2,
    GetImage = 3,
    JpegData = 4,
    RawMatrixData = 5,
    GetSensor = 6,
    SensorData = 7,
    SetSensor = 8,
    GetParameter = 9,
    SetParameter = 10,
    ParameterData = 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ImageFormat {
    Jpeg = 0,
    RawMatrix = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Wrap an encoded payload.
    pub fn wrap(kind: MessageType, payload: &impl Message) -> Self {
        Self {
            r#type: kind as i32,
            data: payload.encode_to_vec(),
        }
    }

    /// Envelope with no payload.
    pub fn empty(kind: MessageType) -> Self {
        Self {
            r#type: kind as i32,
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.r#type).map_err(|_| ProtocolError::UnknownType(self.r#type))
    }

    /// Decode the payload as `M`.
    pub fn payload<M: Message + Default>(&self) -> Result<M, ProtocolError> {
        Ok(M::decode(self.data.as_slice())?)
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self::wrap(
            MessageType::Error,
            &ErrorReply {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorReply {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CameraInfoEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub label: String,
    #[prost(bool, tag = "3")]
    pub still_enabled: bool,
    #[prost(bool, tag = "4")]
    pub video_enabled: bool,
    #[prost(bool, tag = "5")]
    pub hdr_enabled: bool,
    #[prost(bool, tag = "6")]
    pub disabled: bool,
    #[prost(uint32, tag = "7")]
    pub trigger_divider: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct CameraInfoList {
    #[prost(message, repeated, tag = "1")]
    pub cameras: Vec<CameraInfoEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SensorInfoEntry {
    #[prost(string, tag = "1")]
    pub sensor_id: String,
    #[prost(string, tag = "2")]
    pub header: String,
    /// `synchronous` or `asynchronous`
    #[prost(string, tag = "3")]
    pub class: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SensorInfoList {
    #[prost(message, repeated, tag = "1")]
    pub sensors: Vec<SensorInfoEntry>,
    #[prost(uint64, tag = "2")]
    pub synchronous_timeout_ms: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ImageRequest {
    #[prost(string, repeated, tag = "1")]
    pub cameras: Vec<String>,
    #[prost(enumeration = "ImageFormat", tag = "2")]
    pub format: i32,
    /// Percent, default 100
    #[prost(double, optional, tag = "3")]
    pub scale: Option<f64>,
    /// JPEG quality, default 75
    #[prost(uint32, optional, tag = "4")]
    pub quality: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct JpegImage {
    #[prost(string, tag = "1")]
    pub camera: String,
    #[prost(uint64, tag = "2")]
    pub image_number: u64,
    /// Seconds since the Unix epoch
    #[prost(double, tag = "3")]
    pub timestamp: f64,
    #[prost(uint32, tag = "4")]
    pub width: u32,
    #[prost(uint32, tag = "5")]
    pub height: u32,
    #[prost(uint32, tag = "6")]
    pub exposure_us: u32,
    #[prost(double, tag = "7")]
    pub gain: f64,
    #[prost(string, tag = "8")]
    pub filename: String,
    #[prost(string, tag = "9")]
    pub label: String,
    #[prost(bytes = "vec", tag = "10")]
    pub jpg_data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RawMatrix {
    #[prost(string, tag = "1")]
    pub camera: String,
    #[prost(uint64, tag = "2")]
    pub image_number: u64,
    #[prost(double, tag = "3")]
    pub timestamp: f64,
    #[prost(uint32, tag = "4")]
    pub rows: u32,
    #[prost(uint32, tag = "5")]
    pub cols: u32,
    #[prost(uint32, tag = "6")]
    pub channels: u32,
    /// Bytes per element
    #[prost(uint32, tag = "7")]
    pub elt_size: u32,
    #[prost(uint32, tag = "8")]
    pub exposure_us: u32,
    #[prost(double, tag = "9")]
    pub gain: f64,
    #[prost(string, tag = "10")]
    pub filename: String,
    #[prost(string, tag = "11")]
    pub label: String,
    #[prost(bytes = "vec", tag = "12")]
    pub mat_data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SensorQuery {
    /// Empty or `none` selects every sensor
    #[prost(string, tag = "1")]
    pub sensor_id: String,
    /// Empty selects every header of the sensor
    #[prost(string, tag = "2")]
    pub header: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SensorReadingMsg {
    #[prost(string, tag = "1")]
    pub sensor_id: String,
    #[prost(string, tag = "2")]
    pub header: String,
    #[prost(double, tag = "3")]
    pub timestamp: f64,
    #[prost(string, tag = "4")]
    pub data: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SensorDataList {
    #[prost(message, repeated, tag = "1")]
    pub sensors: Vec<SensorReadingMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ParameterRequest {
    #[prost(string, tag = "1")]
    pub module: String,
    #[prost(string, tag = "2")]
    pub parameter: String,
    /// Ignored for GET_PARAMETER
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ParameterData {
    #[prost(string, tag = "1")]
    pub module: String,
    #[prost(string, tag = "2")]
    pub parameter: String,
    #[prost(string, tag = "3")]
    pub value: String,
    #[prost(bool, tag = "4")]
    pub ok: bool,
    /// Empty on success
    #[prost(string, tag = "5")]
    pub error_string: String,
}
