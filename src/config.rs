//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (optional; every field has a default)
//! 2. environment variables prefixed with `TRAWLDAQ_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! TRAWLDAQ_ACQUISITION__TRIGGER_RATE=2.5
//! TRAWLDAQ_APPLICATION__OUTPUT_PATH=/data/camtrawl
//! TRAWLDAQ_DISK__DISK_FREE_MIN_MB=500
//! ```
//!
//! # Example
//!
//! ```no_run
//! use trawl_daq::config::Settings;
//!
//! let settings = Settings::load(Some("camtrawl.toml".as_ref()))?;
//! println!("{} cameras at {} Hz", settings.cameras.len(), settings.acquisition.trigger_rate);
//! # Ok::<(), trawl_daq::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::SensorClass;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings for one collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub disk: DiskConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            cameras: default_cameras(),
            sensors: SensorConfig::default(),
            server: ServerConfig::default(),
            controller: ControllerConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Deployment name written to run metadata
    #[serde(default = "default_name")]
    pub name: String,
    /// Root under which run directories are created
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Per-camera subdirectories or a single shared one
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Logging level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            output_path: default_output_path(),
            output_mode: OutputMode::default(),
            log_level: default_log_level(),
        }
    }
}

/// Output directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// `images/<camera_id>/`, `video/<camera_id>/`
    #[default]
    Separate,
    /// `images/`, `video/`
    Combined,
}

/// Where trigger cycles come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Internal steady clock at `trigger_rate`
    #[default]
    Software,
    /// Controller trigger pulses
    Hardware,
}

/// Highest accepted trigger rate.
pub const MAX_TRIGGER_RATE_HZ: f64 = 1000.0;

/// Shortest trigger period, matching [`MAX_TRIGGER_RATE_HZ`].
pub const MIN_TRIGGER_PERIOD: Duration = Duration::from_millis(1);

/// Longest trigger period. Slower rates are paced at this period.
pub const MAX_TRIGGER_PERIOD: Duration = Duration::from_secs(86_400);

/// Trigger cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Cycles per second (software mode) or heartbeat rate (hardware mode)
    #[serde(default = "default_trigger_rate")]
    pub trigger_rate: f64,
    /// Number of cycles to run; -1 runs until stopped
    #[serde(default = "default_trigger_limit")]
    pub trigger_limit: i64,
    #[serde(default)]
    pub trigger_source: TriggerSource,
    /// Treat a forced-on controller as deployed, and fire one cycle as soon
    /// as triggering starts
    #[serde(default)]
    pub always_trigger_at_start: bool,
    /// Per-bracket capture timeout
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
    /// Bound on pipeline close during stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Consecutive failures before a camera is disabled
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            trigger_rate: default_trigger_rate(),
            trigger_limit: default_trigger_limit(),
            trigger_source: TriggerSource::default(),
            always_trigger_at_start: false,
            capture_timeout_ms: default_capture_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl AcquisitionConfig {
    /// Trigger period derived from `trigger_rate`, kept within
    /// [`MIN_TRIGGER_PERIOD`, `MAX_TRIGGER_PERIOD`].
    pub fn period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.trigger_rate)
            .unwrap_or(MAX_TRIGGER_PERIOD)
            .clamp(MIN_TRIGGER_PERIOD, MAX_TRIGGER_PERIOD)
    }

    /// Accept `rate` if it is finite, positive and at most
    /// [`MAX_TRIGGER_RATE_HZ`].
    pub fn check_trigger_rate(rate: f64) -> Result<f64, ConfigError> {
        if rate.is_finite() && rate > 0.0 && rate <= MAX_TRIGGER_RATE_HZ {
            Ok(rate)
        } else {
            Err(ConfigError::ValidationError(format!(
                "Invalid trigger_rate {}. Must be > 0 and <= {} Hz",
                rate, MAX_TRIGGER_RATE_HZ
            )))
        }
    }

    /// `trigger_limit` as an optional count; `None` means unlimited.
    pub fn limit(&self) -> Option<u64> {
        u64::try_from(self.trigger_limit).ok()
    }
}

/// Geometric transform applied to every frame before it is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
    FlipLr,
    FlipUd,
}

impl Rotation {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rotation::None => "none",
            Rotation::Cw90 => "cw90",
            Rotation::Cw180 => "cw180",
            Rotation::Cw270 => "cw270",
            Rotation::FlipLr => "fliplr",
            Rotation::FlipUd => "flipud",
        }
    }
}

impl FromStr for Rotation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Rotation::None),
            "cw90" => Ok(Rotation::Cw90),
            "cw180" => Ok(Rotation::Cw180),
            "cw270" => Ok(Rotation::Cw270),
            "fliplr" => Ok(Rotation::FlipLr),
            "flipud" => Ok(Rotation::FlipUd),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid rotation '{}'. Must be one of: none, cw90, cw180, cw270, fliplr, flipud",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Rotation {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rotation> for String {
    fn from(value: Rotation) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HDR merge algorithm handed to the external merge tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrMergeMethod {
    #[default]
    Mertens,
    Debevec,
    Robertson,
    ExposureFusion,
}

impl HdrMergeMethod {
    /// Name passed on the merge tool command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            HdrMergeMethod::Mertens => "mertens",
            HdrMergeMethod::Debevec => "debevec",
            HdrMergeMethod::Robertson => "robertson",
            HdrMergeMethod::ExposureFusion => "exposure_fusion",
        }
    }
}

/// One exposure within an HDR sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketSpec {
    pub exposure_us: u32,
    pub gain: f64,
    /// Publish a `BracketCaptured` event once this bracket is captured
    #[serde(default)]
    pub emit_signal: bool,
    /// Save this bracket as a still
    #[serde(default = "default_true")]
    pub save_image: bool,
}

/// Still image encoding options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StillConfig {
    /// File extension, with or without the leading dot
    #[serde(default = "default_still_extension")]
    pub extension: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Scale percentage applied before saving
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl Default for StillConfig {
    fn default() -> Self {
        Self {
            extension: default_still_extension(),
            jpeg_quality: default_jpeg_quality(),
            scale: default_scale(),
        }
    }
}

impl StillConfig {
    /// Extension without the leading dot, lowercased.
    pub fn normalized_extension(&self) -> String {
        self.extension.trim_start_matches('.').to_ascii_lowercase()
    }
}

/// Video encoder profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// External encoder executable
    #[serde(default = "default_video_command")]
    pub encoder_command: String,
    #[serde(default = "default_video_codec")]
    pub codec: String,
    #[serde(default = "default_video_extension")]
    pub extension: String,
    #[serde(default = "default_video_framerate")]
    pub framerate: f64,
    #[serde(default = "default_video_bitrate")]
    pub bitrate: u64,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    /// Frames per file before rolling over to a new part
    #[serde(default = "default_max_frames_per_file")]
    pub max_frames_per_file: u32,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            encoder_command: default_video_command(),
            codec: default_video_codec(),
            extension: default_video_extension(),
            framerate: default_video_framerate(),
            bitrate: default_video_bitrate(),
            pixel_format: default_pixel_format(),
            max_frames_per_file: default_max_frames_per_file(),
            scale: default_scale(),
        }
    }
}

/// Tonemap parameters, passed through to the merge tool unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TonemapConfig {
    #[serde(default = "default_tonemap_gamma")]
    pub gamma: f64,
    #[serde(default = "default_tonemap_saturation")]
    pub saturation: f64,
    #[serde(default = "default_tonemap_bias")]
    pub bias: f64,
}

impl Default for TonemapConfig {
    fn default() -> Self {
        Self {
            gamma: default_tonemap_gamma(),
            saturation: default_tonemap_saturation(),
            bias: default_tonemap_bias(),
        }
    }
}

/// HDR merge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HdrConfig {
    #[serde(default)]
    pub merge_method: HdrMergeMethod,
    /// Output extension of the merged image
    #[serde(default = "default_hdr_save_format")]
    pub save_format: String,
    #[serde(default)]
    pub tonemap: TonemapConfig,
    /// External merge executable
    #[serde(default = "default_hdr_command")]
    pub merge_command: String,
}

impl Default for HdrConfig {
    fn default() -> Self {
        Self {
            merge_method: HdrMergeMethod::default(),
            save_format: default_hdr_save_format(),
            tonemap: TonemapConfig::default(),
            merge_command: default_hdr_command(),
        }
    }
}

/// Camera driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// In-process frame generator
    #[default]
    Simulated,
}

/// Options for the simulated camera driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_sim_width")]
    pub width: u32,
    #[serde(default = "default_sim_height")]
    pub height: u32,
    /// 1 for mono, 3 for RGB
    #[serde(default = "default_sim_channels")]
    pub channels: u8,
    /// Readout time added to each exposure
    #[serde(default = "default_sim_readout")]
    pub readout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: default_sim_width(),
            height: default_sim_height(),
            channels: default_sim_channels(),
            readout_ms: default_sim_readout(),
        }
    }
}

/// Per-camera configuration. Loaded once; runtime changes swap in a new copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: CameraKind,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default = "default_exposure")]
    pub exposure_us: u32,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default = "default_one")]
    pub binning: u32,
    #[serde(default = "default_one")]
    pub trigger_divider: u32,
    #[serde(default = "default_one")]
    pub still_divider: u32,
    #[serde(default = "default_one")]
    pub video_divider: u32,
    #[serde(default = "default_true")]
    pub still_enabled: bool,
    #[serde(default)]
    pub video_enabled: bool,
    #[serde(default)]
    pub hdr_enabled: bool,
    #[serde(default)]
    pub hdr_brackets: Vec<BracketSpec>,
    #[serde(default)]
    pub still: StillConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub hdr: HdrConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl CameraConfig {
    /// Camera with defaults for everything but the id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind: CameraKind::default(),
            gain: default_gain(),
            exposure_us: default_exposure(),
            rotation: Rotation::default(),
            binning: 1,
            trigger_divider: 1,
            still_divider: 1,
            video_divider: 1,
            still_enabled: true,
            video_enabled: false,
            hdr_enabled: false,
            hdr_brackets: Vec::new(),
            still: StillConfig::default(),
            video: VideoConfig::default(),
            hdr: HdrConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }

    /// Brackets to run in one cycle. Non-HDR cameras run one implicit bracket.
    pub fn effective_brackets(&self) -> Vec<BracketSpec> {
        if self.hdr_enabled && !self.hdr_brackets.is_empty() {
            self.hdr_brackets.clone()
        } else {
            vec![BracketSpec {
                exposure_us: self.exposure_us,
                gain: self.gain,
                emit_signal: false,
                save_image: true,
            }]
        }
    }

    /// Check the invariants of a single camera.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Camera id cannot be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("trigger_divider", self.trigger_divider),
            ("still_divider", self.still_divider),
            ("video_divider", self.video_divider),
            ("binning", self.binning),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Camera '{}': {} must be >= 1",
                    self.id, name
                )));
            }
        }
        if !(self.gain.is_finite() && self.gain >= 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': gain must be a non-negative number",
                self.id
            )));
        }
        if self.hdr_enabled && self.hdr_brackets.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': hdr_enabled requires at least one entry in hdr_brackets",
                self.id
            )));
        }
        let valid_extensions = ["jpg", "jpeg", "png", "tif", "tiff", "bmp"];
        let ext = self.still.normalized_extension();
        if !valid_extensions.contains(&ext.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': invalid still extension '{}'. Must be one of: {}",
                self.id,
                self.still.extension,
                valid_extensions.join(", ")
            )));
        }
        if !(1..=100).contains(&self.still.jpeg_quality) {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': jpeg_quality must be 1-100",
                self.id
            )));
        }
        for (name, scale) in [("still", self.still.scale), ("video", self.video.scale)] {
            if !(scale > 0.0 && scale <= 100.0) {
                return Err(ConfigError::ValidationError(format!(
                    "Camera '{}': {} scale must be in (0, 100]",
                    self.id, name
                )));
            }
        }
        if self.video.max_frames_per_file == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': video max_frames_per_file must be >= 1",
                self.id
            )));
        }
        if !(self.video.framerate > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': video framerate must be > 0",
                self.id
            )));
        }
        if !matches!(self.simulation.channels, 1 | 3) {
            return Err(ConfigError::ValidationError(format!(
                "Camera '{}': simulation channels must be 1 or 3",
                self.id
            )));
        }
        Ok(())
    }
}

/// Sensor classification and synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Class of headers not listed below
    #[serde(default = "default_sensor_class")]
    pub default_type: SensorClass,
    /// Headers that must arrive for a record to be complete
    #[serde(default)]
    pub synchronous: Vec<String>,
    /// Headers attached opportunistically
    #[serde(default = "default_async_headers")]
    pub asynchronous: Vec<String>,
    /// Maximum wait for synchronous readings and the whole cycle join
    #[serde(default = "default_sync_timeout")]
    pub synchronous_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            default_type: default_sensor_class(),
            synchronous: Vec::new(),
            asynchronous: default_async_headers(),
            synchronous_timeout_ms: default_sync_timeout(),
        }
    }
}

impl SensorConfig {
    /// Classify a header.
    pub fn class_of(&self, header: &str) -> SensorClass {
        if self.synchronous.iter().any(|h| h == header) {
            SensorClass::Synchronous
        } else if self.asynchronous.iter().any(|h| h == header) {
            SensorClass::Asynchronous
        } else {
            self.default_type
        }
    }

    pub fn synchronous_timeout(&self) -> Duration {
        Duration::from_millis(self.synchronous_timeout_ms)
    }
}

/// Protocol server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted frame body
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: default_interface(),
            port: default_port(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }
}

/// Deployment controller serial link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Strobe pre-fire delay in microseconds
    #[serde(default = "default_strobe_pre_fire")]
    pub strobe_pre_fire_us: u32,
    #[serde(default = "default_one")]
    pub strobe_channel: u32,
    /// Link is considered lost after this long without any inbound line
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub ntp_sync_clock_at_boot: bool,
    #[serde(default)]
    pub ntp_sync_while_deployed: bool,
    #[serde(default = "default_ntp_interval")]
    pub ntp_sync_interval_s: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            strobe_pre_fire_us: default_strobe_pre_fire(),
            strobe_channel: 1,
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            ntp_sync_clock_at_boot: false,
            ntp_sync_while_deployed: false,
            ntp_sync_interval_s: default_ntp_interval(),
        }
    }
}

/// Disk watchdog thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_disk_free_min")]
    pub disk_free_min_mb: u64,
    #[serde(default = "default_disk_check_interval")]
    pub disk_free_check_int_ms: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            disk_free_min_mb: default_disk_free_min(),
            disk_free_check_int_ms: default_disk_check_interval(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "camtrawl".to_string()
}

fn default_output_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trigger_rate() -> f64 {
    5.0
}

fn default_trigger_limit() -> i64 {
    -1
}

fn default_capture_timeout() -> u64 {
    2000
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_cameras() -> Vec<CameraConfig> {
    vec![CameraConfig::new("camera0")]
}

fn default_gain() -> f64 {
    18.0
}

fn default_exposure() -> u32 {
    4000
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_still_extension() -> String {
    "jpg".to_string()
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_scale() -> f64 {
    100.0
}

fn default_video_command() -> String {
    "ffmpeg".to_string()
}

fn default_video_codec() -> String {
    "mpeg4".to_string()
}

fn default_video_extension() -> String {
    "mp4".to_string()
}

fn default_video_framerate() -> f64 {
    10.0
}

fn default_video_bitrate() -> u64 {
    1_200_000
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_max_frames_per_file() -> u32 {
    1000
}

fn default_tonemap_gamma() -> f64 {
    2.0
}

fn default_tonemap_saturation() -> f64 {
    1.0
}

fn default_tonemap_bias() -> f64 {
    0.85
}

fn default_hdr_save_format() -> String {
    "hdr".to_string()
}

fn default_hdr_command() -> String {
    "trawl-hdr-merge".to_string()
}

fn default_sim_width() -> u32 {
    640
}

fn default_sim_height() -> u32 {
    480
}

fn default_sim_channels() -> u8 {
    1
}

fn default_sim_readout() -> u64 {
    5
}

fn default_sensor_class() -> SensorClass {
    SensorClass::Synchronous
}

fn default_async_headers() -> Vec<String> {
    ["$CTCS", "$SBCS", "$IMUC", "$CTSV"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sync_timeout() -> u64 {
    5000
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7889
}

fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    57600
}

fn default_strobe_pre_fire() -> u32 {
    150
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_ntp_interval() -> u64 {
    3600
}

fn default_disk_free_min() -> u64 {
    1000
}

fn default_disk_check_interval() -> u64 {
    5000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from an optional TOML file and `TRAWLDAQ_` environment
    /// variables, then validate.
    ///
    /// Precedence (highest first): environment, file, built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed("TRAWLDAQ_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Look up a camera by id.
    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// Validate cross-field consistency.
    ///
    /// Checks:
    /// - Log level is valid
    /// - Trigger rate is positive, finite and at most 1 kHz, limit >= -1
    /// - Timeouts are nonzero
    /// - Camera ids are unique and each camera is internally consistent
    /// - Hardware triggering has an enabled controller
    /// - Server port is nonzero when the server is enabled
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acq = &self.acquisition;
        AcquisitionConfig::check_trigger_rate(acq.trigger_rate)?;
        if acq.trigger_limit < -1 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid trigger_limit {}. Must be >= 0, or -1 for unlimited",
                acq.trigger_limit
            )));
        }
        if acq.capture_timeout_ms == 0 || self.sensors.synchronous_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "capture_timeout_ms and synchronous_timeout_ms must be > 0".to_string(),
            ));
        }
        if acq.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "max_consecutive_failures must be >= 1".to_string(),
            ));
        }

        if self.cameras.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one camera must be configured".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if !ids.insert(camera.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate camera ID: '{}'",
                    camera.id
                )));
            }
            if camera.id == crate::parameter::ACQUISITION_MODULE {
                return Err(ConfigError::ValidationError(format!(
                    "Camera ID '{}' is reserved",
                    camera.id
                )));
            }
            camera.validate()?;
        }

        if acq.trigger_source == TriggerSource::Hardware && !self.controller.enabled {
            return Err(ConfigError::ValidationError(
                "trigger_source = \"hardware\" requires controller.enabled = true".to_string(),
            ));
        }
        if self.controller.enabled && self.controller.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "controller.heartbeat_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.server.enabled && self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be nonzero".to_string(),
            ));
        }
        if self.disk.disk_free_check_int_ms == 0 {
            return Err(ConfigError::ValidationError(
                "disk.disk_free_check_int_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.acquisition.trigger_rate, 5.0);
        assert_eq!(settings.acquisition.trigger_limit, -1);
        assert_eq!(settings.server.port, 7889);
        assert_eq!(settings.controller.baud_rate, 57600);
        assert_eq!(settings.cameras.len(), 1);
        assert_eq!(settings.cameras[0].exposure_us, 4000);
        assert_eq!(settings.cameras[0].still.jpeg_quality, 90);
        assert_eq!(settings.cameras[0].hdr.tonemap.bias, 0.85);
        assert!(settings.acquisition.limit().is_none());
    }

    #[test]
    fn test_rotation_is_case_insensitive() {
        let toml = r#"
            [[cameras]]
            id = "port"
            rotation = "None"

            [[cameras]]
            id = "starboard"
            rotation = "CW90"
        "#;
        let settings = Settings::from_toml_str(toml).unwrap();
        assert_eq!(settings.cameras[0].rotation, Rotation::None);
        assert_eq!(settings.cameras[1].rotation, Rotation::Cw90);
    }

    #[test]
    fn test_unknown_rotation_is_error() {
        let toml = r#"
            [[cameras]]
            id = "port"
            rotation = "sideways"
        "#;
        let err = Settings::from_toml_str(toml).unwrap_err();
        assert!(
            err.to_string().contains("rotation"),
            "error should mention rotation: {}",
            err
        );
    }

    #[test]
    fn test_duplicate_camera_ids_rejected() {
        let toml = r#"
            [[cameras]]
            id = "cam"
            [[cameras]]
            id = "cam"
        "#;
        let err = Settings::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate camera ID"));
    }

    #[test]
    fn test_zero_divider_rejected() {
        let toml = r#"
            [[cameras]]
            id = "cam"
            still_divider = 0
        "#;
        assert!(Settings::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_hdr_without_brackets_rejected() {
        let toml = r#"
            [[cameras]]
            id = "cam"
            hdr_enabled = true
        "#;
        let err = Settings::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("hdr_brackets"));
    }

    #[test]
    fn test_hardware_trigger_requires_controller() {
        let toml = r#"
            [acquisition]
            trigger_source = "hardware"
        "#;
        assert!(Settings::from_toml_str(toml).is_err());

        let toml = r#"
            [acquisition]
            trigger_source = "hardware"
            [controller]
            enabled = true
        "#;
        assert!(Settings::from_toml_str(toml).is_ok());
    }

    #[test]
    fn test_limit_below_minus_one_rejected() {
        let toml = r#"
            [acquisition]
            trigger_limit = -2
        "#;
        assert!(Settings::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_trigger_rate_upper_bound() {
        let toml = r#"
            [acquisition]
            trigger_rate = 1e12
            trigger_source = "hardware"

            [controller]
            enabled = true
        "#;
        assert!(Settings::from_toml_str(toml).is_err());

        let toml = r#"
            [acquisition]
            trigger_rate = 1000.0
        "#;
        assert!(Settings::from_toml_str(toml).is_ok());
    }

    #[test]
    fn test_period_stays_in_range() {
        let period = |trigger_rate| {
            AcquisitionConfig {
                trigger_rate,
                ..AcquisitionConfig::default()
            }
            .period()
        };
        assert_eq!(period(1e12), MIN_TRIGGER_PERIOD);
        assert_eq!(period(1e-300), MAX_TRIGGER_PERIOD);
        assert_eq!(period(4.0), Duration::from_millis(250));
    }

    #[test]
    fn test_effective_brackets() {
        let mut cam = CameraConfig::new("cam");
        let implicit = cam.effective_brackets();
        assert_eq!(implicit.len(), 1);
        assert_eq!(implicit[0].exposure_us, cam.exposure_us);
        assert!(implicit[0].save_image);

        cam.hdr_enabled = true;
        cam.hdr_brackets = vec![
            BracketSpec { exposure_us: 1000, gain: 0.0, emit_signal: false, save_image: true },
            BracketSpec { exposure_us: 4000, gain: 0.0, emit_signal: true, save_image: false },
        ];
        let brackets = cam.effective_brackets();
        assert_eq!(brackets.len(), 2);
        assert_eq!(brackets[1].exposure_us, 4000);
    }

    #[test]
    fn test_sensor_classification() {
        let sensors = SensorConfig {
            synchronous: vec!["$OHPR".into()],
            ..SensorConfig::default()
        };
        assert_eq!(sensors.class_of("$OHPR"), SensorClass::Synchronous);
        assert_eq!(sensors.class_of("$IMUC"), SensorClass::Asynchronous);
        assert_eq!(sensors.class_of("$GPGGA"), SensorClass::Synchronous);
    }

    #[test]
    fn test_still_extension_normalized() {
        let still = StillConfig {
            extension: ".JPG".into(),
            ..StillConfig::default()
        };
        assert_eq!(still.normalized_extension(), "jpg");
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camtrawl.toml");
        std::fs::write(
            &path,
            r#"
            [acquisition]
            trigger_rate = 2.0
            trigger_limit = 10
            "#,
        )
        .unwrap();

        std::env::set_var("TRAWLDAQ_ACQUISITION__TRIGGER_LIMIT", "25");
        std::env::set_var("TRAWLDAQ_DISK__DISK_FREE_MIN_MB", "500");
        let loaded = Settings::load(Some(&path));
        std::env::remove_var("TRAWLDAQ_ACQUISITION__TRIGGER_LIMIT");
        std::env::remove_var("TRAWLDAQ_DISK__DISK_FREE_MIN_MB");

        let settings = loaded.unwrap();
        assert_eq!(settings.acquisition.trigger_rate, 2.0);
        assert_eq!(settings.acquisition.trigger_limit, 25);
        assert_eq!(settings.disk.disk_free_min_mb, 500);
    }

    #[test]
    #[serial_test::serial]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load(Some(Path::new("/nonexistent/camtrawl.toml"))).unwrap();
        assert_eq!(settings.cameras[0].id, "camera0");
    }
}
