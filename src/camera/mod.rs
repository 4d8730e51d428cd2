//! Cameras and their per-cycle pipelines.
//!
//! Hardware families implement [`CameraDevice`]; the Scheduler and
//! [`CameraPipeline`] only ever see the trait object.

pub mod encoder;
pub mod mock;
pub mod pipeline;
pub mod transform;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{BracketSpec, CameraConfig, CameraKind};
use crate::core::Frame;
use crate::error::CaptureError;

pub use mock::SimulatedCamera;
pub use pipeline::{CameraPipeline, CycleOutcome, CyclePlan, Encoders};

/// Capability interface for one camera.
///
/// Implementations must be safe to share across tasks. `capture` may block on
/// hardware for up to one exposure plus readout; the pipeline bounds it with
/// the configured capture timeout.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Camera id from configuration.
    fn id(&self) -> &str;

    /// Apply a (possibly updated) configuration.
    async fn configure(&self, config: &CameraConfig) -> Result<(), CaptureError>;

    /// Expose one frame with the bracket's exposure and gain.
    async fn capture(&self, bracket: &BracketSpec) -> Result<Frame, CaptureError>;

    /// Release the device.
    async fn close(&self) -> Result<(), CaptureError>;
}

/// Open the driver for a configured camera.
pub fn open_device(config: &CameraConfig) -> Arc<dyn CameraDevice> {
    match config.kind {
        CameraKind::Simulated => Arc::new(SimulatedCamera::from_config(config)),
    }
}
