//! Simulated Camera
//!
//! In-process camera used when no hardware is attached and throughout the
//! tests. All waits use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - Capture takes the bracket exposure plus a fixed readout time
//! - Frame brightness scales with exposure × gain, with a little noise
//! - Failures can be injected (`fail_next`) and the camera can be made to
//!   hang (`set_unresponsive`) so timeout paths can be exercised

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::camera::CameraDevice;
use crate::config::{BracketSpec, CameraConfig};
use crate::core::Frame;
use crate::error::CaptureError;

#[derive(Debug, Default)]
struct SimState {
    frame_count: u64,
    exposures: Vec<u32>,
    fail_remaining: u32,
    unresponsive: bool,
    closed: bool,
    configured_exposure_us: u32,
    configured_gain: f64,
    configure_calls: u32,
}

/// Simulated camera with failure injection.
///
/// # Example
///
/// ```rust,ignore
/// let camera = SimulatedCamera::new("port", 64, 48);
/// camera.fail_next(2).await;
/// assert!(camera.capture(&bracket).await.is_err());
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    id: String,
    width: u32,
    height: u32,
    channels: u8,
    readout: Duration,
    state: Arc<RwLock<SimState>>,
}

impl SimulatedCamera {
    /// Create a mono camera with a 1ms readout.
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            channels: 1,
            readout: Duration::from_millis(1),
            state: Arc::new(RwLock::new(SimState::default())),
        }
    }

    /// Create a camera with the geometry from configuration. Binning divides
    /// the sensor size.
    pub fn from_config(config: &CameraConfig) -> Self {
        let sim = &config.simulation;
        let binning = config.binning.max(1);
        Self {
            id: config.id.clone(),
            width: (sim.width / binning).max(1),
            height: (sim.height / binning).max(1),
            channels: sim.channels,
            readout: Duration::from_millis(sim.readout_ms),
            state: Arc::new(RwLock::new(SimState {
                configured_exposure_us: config.exposure_us,
                configured_gain: config.gain,
                ..SimState::default()
            })),
        }
    }

    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    /// Make the next `n` captures fail with a device error.
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.fail_remaining = n;
    }

    /// Make captures hang until cleared.
    pub async fn set_unresponsive(&self, unresponsive: bool) {
        self.state.write().await.unresponsive = unresponsive;
    }

    /// Number of successful captures.
    pub async fn frame_count(&self) -> u64 {
        self.state.read().await.frame_count
    }

    /// Exposures of every successful capture, in order.
    pub async fn captured_exposures(&self) -> Vec<u32> {
        self.state.read().await.exposures.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Exposure and gain from the last `configure` call.
    pub async fn configured(&self) -> (u32, f64) {
        let state = self.state.read().await;
        (state.configured_exposure_us, state.configured_gain)
    }

    /// Number of `configure` calls so far.
    pub async fn configure_calls(&self) -> u32 {
        self.state.read().await.configure_calls
    }

    fn render(&self, bracket: &BracketSpec) -> Frame {
        let len = self.width as usize * self.height as usize * self.channels as usize;
        let level = (bracket.exposure_us as f64 * (1.0 + bracket.gain) / 400.0).min(230.0);
        let mut rng = rand::thread_rng();
        let stride = self.width as usize * self.channels as usize;
        let pixels: Vec<u8> = (0..len)
            .map(|i| {
                let x = (i % stride.max(1)) as f64 / stride.max(1) as f64;
                let noise: f64 = rng.gen_range(0.0..8.0);
                (level * (0.5 + 0.5 * x) + noise).min(255.0) as u8
            })
            .collect();
        Frame {
            width: self.width,
            height: self.height,
            channels: self.channels,
            pixels: pixels.into(),
        }
    }
}

#[async_trait]
impl CameraDevice for SimulatedCamera {
    fn id(&self) -> &str {
        &self.id
    }

    async fn configure(&self, config: &CameraConfig) -> Result<(), CaptureError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(CaptureError::Closed);
        }
        state.configured_exposure_us = config.exposure_us;
        state.configured_gain = config.gain;
        state.configure_calls += 1;
        debug!(camera = %self.id, exposure_us = config.exposure_us, gain = config.gain, "Configured");
        Ok(())
    }

    async fn capture(&self, bracket: &BracketSpec) -> Result<Frame, CaptureError> {
        let unresponsive = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CaptureError::Closed);
            }
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(CaptureError::Device(format!("{}: injected failure", self.id)));
            }
            state.unresponsive
        };

        if unresponsive {
            // Hang until the pipeline's timeout gives up on us
            std::future::pending::<()>().await;
        }

        sleep(Duration::from_micros(bracket.exposure_us as u64) + self.readout).await;
        let frame = self.render(bracket);

        let mut state = self.state.write().await;
        state.frame_count += 1;
        state.exposures.push(bracket.exposure_us);
        trace!(camera = %self.id, frame = state.frame_count, exposure_us = bracket.exposure_us, "Captured");
        Ok(frame)
    }

    async fn close(&self) -> Result<(), CaptureError> {
        self.state.write().await.closed = true;
        debug!(camera = %self.id, "Closed");
        Ok(())
    }
}
