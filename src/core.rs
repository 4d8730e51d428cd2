//! Core data types shared by every component.
//!
//! One trigger cycle produces:
//!
//! ```text
//! TriggerEvent ──┬── CaptureResult (per camera, per bracket) ──> CaptureSummary
//!                └── SensorSnapshot
//!                          │
//!                          ▼
//!                  AcquisitionRecord ──> metadata store, shared state, server
//! ```
//!
//! `TriggerEvent` is shared through an `Arc` so every record derived from a
//! cycle refers to the same immutable event.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{BracketSpec, TriggerSource};

// =============================================================================
// Trigger
// =============================================================================

/// One trigger cycle. Created by the Scheduler, never mutated.
#[derive(Clone, Debug, Serialize)]
pub struct TriggerEvent {
    /// Monotonic cycle number starting at 0
    pub sequence_number: u64,
    /// Wall clock time the cycle fired
    pub timestamp: DateTime<Utc>,
    /// Steady clock instant the cycle fired
    #[serde(skip)]
    pub instant: tokio::time::Instant,
    pub source: TriggerSource,
}

impl TriggerEvent {
    pub fn new(sequence_number: u64, source: TriggerSource) -> Self {
        Self {
            sequence_number,
            timestamp: Utc::now(),
            instant: tokio::time::Instant::now(),
            source,
        }
    }
}

// =============================================================================
// Frames and capture results
// =============================================================================

/// 8-bit image in row-major, interleaved layout.
///
/// `pixels.len() == width * height * channels`. Cloning is cheap.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// 1 (mono) or 3 (RGB)
    pub channels: u8,
    pub pixels: Bytes,
}

impl Frame {
    /// Construct a frame, checking the buffer length against the geometry.
    pub fn new(width: u32, height: u32, channels: u8, pixels: impl Into<Bytes>) -> Option<Self> {
        let pixels = pixels.into();
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected || !matches!(channels, 1 | 3) {
            return None;
        }
        Some(Self {
            width,
            height,
            channels,
            pixels,
        })
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn memory_bytes(&self) -> usize {
        self.pixels.len()
    }
}

/// Output of one capture call.
///
/// The frame is owned here until it is consumed by an encode step.
#[derive(Clone, Debug)]
pub struct CaptureResult {
    pub camera_id: String,
    pub trigger: Arc<TriggerEvent>,
    /// 0 for non-HDR cameras
    pub bracket_index: usize,
    pub frame: Frame,
    pub exposure_us: u32,
    pub gain: f64,
}

impl CaptureResult {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }
}

/// Per-bracket outcome inside a capture summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BracketSummary {
    pub index: usize,
    pub exposure_us: u32,
    pub gain: f64,
    /// Error code when the capture failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub still_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl BracketSummary {
    pub fn pending(index: usize, spec: &BracketSpec) -> Self {
        Self {
            index,
            exposure_us: spec.exposure_us,
            gain: spec.gain,
            error: None,
            still_path: None,
            width: None,
            height: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Camera outcome for one cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CaptureStatus {
    /// Every bracket captured
    Captured,
    /// At least one bracket failed; `code` is the first failure's code
    Failed { code: String, message: String },
    /// Previous cycle's capture still running at this cycle's start or
    /// this cycle's capture missed the join deadline
    Busy,
    /// Camera removed from the run
    Disabled,
}

/// Per-camera summary embedded in an AcquisitionRecord.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub camera_id: String,
    pub status: CaptureStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brackets: Vec<BracketSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr_path: Option<PathBuf>,
    #[serde(default)]
    pub video_frame: bool,
}

impl CaptureSummary {
    pub fn absent(camera_id: &str, status: CaptureStatus) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            status,
            brackets: Vec::new(),
            hdr_path: None,
            video_frame: false,
        }
    }

    pub fn is_captured(&self) -> bool {
        self.status == CaptureStatus::Captured
    }
}

// =============================================================================
// Sensors
// =============================================================================

/// Whether a sensor's readings gate record completeness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorClass {
    Synchronous,
    Asynchronous,
}

impl fmt::Display for SensorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorClass::Synchronous => f.write_str("synchronous"),
            SensorClass::Asynchronous => f.write_str("asynchronous"),
        }
    }
}

/// One tagged reading from a sensor source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    /// Data header, e.g. `$OHPR`
    pub header: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque payload, usually the raw sentence
    pub payload: String,
    pub class: SensorClass,
}

impl SensorReading {
    pub fn new(
        sensor_id: impl Into<String>,
        header: impl Into<String>,
        payload: impl Into<String>,
        class: SensorClass,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            header: header.into(),
            timestamp: Utc::now(),
            payload: payload.into(),
            class,
        }
    }
}

/// Sensor values attached to one cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub readings: Vec<SensorReading>,
    /// All configured synchronous headers were satisfied
    pub complete: bool,
}

// =============================================================================
// Records
// =============================================================================

/// Unified result of one trigger cycle.
#[derive(Clone, Debug, Serialize)]
pub struct AcquisitionRecord {
    pub trigger: Arc<TriggerEvent>,
    pub cameras: Vec<CaptureSummary>,
    pub sensors: SensorSnapshot,
    pub disk_free_mb: Option<u64>,
}

impl AcquisitionRecord {
    pub fn sequence_number(&self) -> u64 {
        self.trigger.sequence_number
    }

    /// True when every camera still in the run captured and the sensor
    /// snapshot is complete.
    pub fn is_complete(&self) -> bool {
        self.sensors.complete
            && self
                .cameras
                .iter()
                .all(|c| c.is_captured() || c.status == CaptureStatus::Disabled)
    }

    pub fn camera(&self, camera_id: &str) -> Option<&CaptureSummary> {
        self.cameras.iter().find(|c| c.camera_id == camera_id)
    }
}
