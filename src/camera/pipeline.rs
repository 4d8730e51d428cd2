//! Camera Pipeline
//!
//! One pipeline per configured camera executes that camera's share of a
//! trigger cycle:
//!
//! ```text
//! for each bracket (ascending index):
//!     capture ──> rotate ──┬──> still encoder   (still divider, save_image)
//!                          ├──> video session   (bracket 0, video divider)
//!                          └──> kept for merge
//! after the last bracket:
//!     HDR merge (only if every bracket succeeded)
//! ```
//!
//! A failed bracket ends the sequence for this cycle; the remaining brackets
//! are recorded as skipped and no merge is attempted.
//!
//! Encode paths that report `EncodeError::Unavailable` are disabled for the
//! rest of the run after a single warning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::camera::encoder::{
    HdrMergeRequest, HdrMerger, StillEncoder, VideoEncoder, VideoGeometry, VideoWriter,
};
use crate::camera::{transform, CameraDevice};
use crate::collection::{hdr_file_name, still_file_name, video_file_name};
use crate::config::{BracketSpec, CameraConfig, VideoConfig};
use crate::core::{
    BracketSummary, CaptureResult, CaptureStatus, CaptureSummary, Frame, TriggerEvent,
};
use crate::error::{CaptureError, EncodeError};
use crate::events::{AcquisitionEvent, EventBus, OutputPath};

/// Which outputs a cycle should produce for this camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    pub save_still: bool,
    pub record_video: bool,
}

impl CyclePlan {
    /// Plan for `sequence_number` from the camera's dividers. `None` when the
    /// camera is not active this cycle.
    pub fn for_sequence(config: &CameraConfig, sequence_number: u64) -> Option<Self> {
        if sequence_number % config.trigger_divider.max(1) as u64 != 0 {
            return None;
        }
        Some(Self {
            save_still: config.still_enabled && sequence_number % config.still_divider.max(1) as u64 == 0,
            record_video: config.video_enabled
                && sequence_number % config.video_divider.max(1) as u64 == 0,
        })
    }
}

/// Encoder implementations shared by every pipeline.
#[derive(Clone)]
pub struct Encoders {
    pub still: Arc<dyn StillEncoder>,
    pub video: Arc<dyn VideoEncoder>,
    pub hdr: Arc<dyn HdrMerger>,
}

/// Result of one cycle for one camera.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub summary: CaptureSummary,
    /// Rotated frame of bracket 0, for the latest-image cache
    pub preview: Option<Frame>,
    /// First capture error of the cycle
    pub error: Option<CaptureError>,
}

/// Run-long video output for one camera, rolled over every
/// `max_frames_per_file` frames.
struct VideoSession {
    dir: PathBuf,
    camera_id: String,
    writer: Option<Box<dyn VideoWriter>>,
    geometry: Option<VideoGeometry>,
    frames_in_part: u32,
    part: u32,
    total_frames: u64,
}

impl VideoSession {
    fn new(dir: PathBuf, camera_id: String) -> Self {
        Self {
            dir,
            camera_id,
            writer: None,
            geometry: None,
            frames_in_part: 0,
            part: 0,
            total_frames: 0,
        }
    }

    async fn append(
        &mut self,
        encoder: &dyn VideoEncoder,
        frame: &Frame,
        profile: &VideoConfig,
    ) -> Result<(), EncodeError> {
        let frame = transform::scale(frame, profile.scale);
        let geometry = VideoGeometry::of(&frame);
        let rollover = self.frames_in_part >= profile.max_frames_per_file
            || self.geometry.is_some_and(|g| g != geometry);
        if rollover {
            self.finish_part().await?;
        }
        if self.writer.is_none() {
            let path = self
                .dir
                .join(video_file_name(&self.camera_id, self.part, &profile.extension));
            self.writer = Some(encoder.open(&path, geometry, profile).await?);
            self.geometry = Some(geometry);
        }
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_frame(&frame).await {
                if matches!(e, EncodeError::Unavailable(_)) {
                    self.writer = None;
                    self.geometry = None;
                }
                return Err(e);
            }
            self.frames_in_part += 1;
            self.total_frames += 1;
        }
        Ok(())
    }

    async fn finish_part(&mut self) -> Result<(), EncodeError> {
        if let Some(writer) = self.writer.take() {
            self.part += 1;
            self.frames_in_part = 0;
            self.geometry = None;
            writer.finish().await?;
        }
        Ok(())
    }
}

/// Per-camera capture and encode pipeline.
pub struct CameraPipeline {
    config: CameraConfig,
    device: Arc<dyn CameraDevice>,
    encoders: Encoders,
    events: Arc<EventBus>,
    images_dir: PathBuf,
    capture_timeout: Duration,
    video: VideoSession,
    disabled_paths: HashSet<OutputPath>,
}

impl CameraPipeline {
    pub fn new(
        config: CameraConfig,
        device: Arc<dyn CameraDevice>,
        encoders: Encoders,
        events: Arc<EventBus>,
        images_dir: &Path,
        video_dir: &Path,
        capture_timeout: Duration,
    ) -> Self {
        let video = VideoSession::new(video_dir.to_path_buf(), config.id.clone());
        Self {
            config,
            device,
            encoders,
            events,
            images_dir: images_dir.to_path_buf(),
            capture_timeout,
            video,
            disabled_paths: HashSet::new(),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn is_path_disabled(&self, path: OutputPath) -> bool {
        self.disabled_paths.contains(&path)
    }

    /// Replace the effective configuration, pushing it to the device only
    /// when `reconfigure_device` is set.
    pub async fn apply_config(
        &mut self,
        config: CameraConfig,
        reconfigure_device: bool,
    ) -> Result<(), CaptureError> {
        if reconfigure_device {
            self.device.configure(&config).await?;
        }
        self.config = config;
        Ok(())
    }

    /// Capture one bracket, bounded by the capture timeout.
    pub async fn capture(
        &self,
        trigger: &Arc<TriggerEvent>,
        bracket_index: usize,
        bracket: &BracketSpec,
    ) -> Result<CaptureResult, CaptureError> {
        let frame = tokio::time::timeout(self.capture_timeout, self.device.capture(bracket))
            .await
            .map_err(|_| CaptureError::Timeout(self.capture_timeout.as_millis() as u64))??;
        Ok(CaptureResult {
            camera_id: self.config.id.clone(),
            trigger: trigger.clone(),
            bracket_index,
            frame,
            exposure_us: bracket.exposure_us,
            gain: bracket.gain,
        })
    }

    /// Run every bracket for one trigger cycle.
    pub async fn run_cycle(&mut self, trigger: Arc<TriggerEvent>, plan: CyclePlan) -> CycleOutcome {
        let seq = trigger.sequence_number;
        let brackets = self.config.effective_brackets();
        let mut summaries = Vec::with_capacity(brackets.len());
        let mut merge_inputs: Vec<CaptureResult> = Vec::with_capacity(brackets.len());
        let mut first_error: Option<CaptureError> = None;
        let mut preview = None;
        let mut video_frame = false;

        for (index, spec) in brackets.iter().enumerate() {
            let mut summary = BracketSummary::pending(index, spec);
            if first_error.is_some() {
                summary.error = Some("skipped".to_string());
                summaries.push(summary);
                continue;
            }

            let mut result = match self.capture(&trigger, index, spec).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(camera = %self.config.id, seq, bracket = index, error = %e, "Capture failed");
                    summary.error = Some(e.code().to_string());
                    summaries.push(summary);
                    first_error = Some(e);
                    continue;
                }
            };
            summary.width = Some(result.width());
            summary.height = Some(result.height());

            if spec.emit_signal {
                self.events
                    .publish(AcquisitionEvent::BracketCaptured {
                        camera_id: self.config.id.clone(),
                        sequence_number: seq,
                        bracket_index: index,
                        exposure_us: spec.exposure_us,
                    })
                    .await;
            }

            result.frame = transform::rotate(&result.frame, self.config.rotation);

            if plan.save_still && spec.save_image && !self.is_path_disabled(OutputPath::Still) {
                let ext = self.config.still.normalized_extension();
                let path = self
                    .images_dir
                    .join(still_file_name(seq, &self.config.id, index, &ext));
                let encoded = self
                    .encoders
                    .still
                    .encode(&result.frame, &path, &self.config.still)
                    .await;
                match encoded {
                    Ok(()) => summary.still_path = Some(path),
                    Err(e) => self.encode_failed(OutputPath::Still, e).await,
                }
            }

            if index == 0 {
                if plan.record_video && !self.is_path_disabled(OutputPath::Video) {
                    let appended = self
                        .video
                        .append(self.encoders.video.as_ref(), &result.frame, &self.config.video)
                        .await;
                    match appended {
                        Ok(()) => video_frame = true,
                        Err(e) => self.encode_failed(OutputPath::Video, e).await,
                    }
                }
                preview = Some(result.frame.clone());
            }

            summaries.push(summary);
            merge_inputs.push(result);
        }

        let mut hdr_path = None;
        if self.config.hdr_enabled
            && plan.save_still
            && first_error.is_none()
            && !self.is_path_disabled(OutputPath::Hdr)
        {
            hdr_path = self.merge(seq, merge_inputs).await;
        } else if self.config.hdr_enabled && first_error.is_some() {
            debug!(camera = %self.config.id, seq, "Bracket failed, HDR merge skipped");
        }

        let status = match &first_error {
            None => CaptureStatus::Captured,
            Some(e) => CaptureStatus::Failed {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        };

        CycleOutcome {
            summary: CaptureSummary {
                camera_id: self.config.id.clone(),
                status,
                brackets: summaries,
                hdr_path,
                video_frame,
            },
            preview,
            error: first_error,
        }
    }

    async fn merge(&mut self, seq: u64, inputs: Vec<CaptureResult>) -> Option<PathBuf> {
        let hdr = &self.config.hdr;
        let output = self
            .images_dir
            .join(hdr_file_name(seq, &self.config.id, &hdr.save_format));
        let request = HdrMergeRequest {
            exposures_us: inputs.iter().map(|r| r.exposure_us).collect(),
            frames: inputs.into_iter().map(|r| r.frame).collect(),
            method: hdr.merge_method,
            tonemap: hdr.tonemap.clone(),
            output,
        };
        let merged = self.encoders.hdr.merge(request).await;
        match merged {
            Ok(path) => {
                self.events
                    .publish(AcquisitionEvent::HdrMerged {
                        camera_id: self.config.id.clone(),
                        sequence_number: seq,
                        path: path.clone(),
                    })
                    .await;
                Some(path)
            }
            Err(e) => {
                self.encode_failed(OutputPath::Hdr, e).await;
                None
            }
        }
    }

    async fn encode_failed(&mut self, path: OutputPath, err: EncodeError) {
        match err {
            EncodeError::Unavailable(reason) => {
                warn!(
                    camera = %self.config.id,
                    path = %path,
                    %reason,
                    "Encoder unavailable, disabling output path for the rest of the run"
                );
                self.disabled_paths.insert(path);
                self.events
                    .publish(AcquisitionEvent::PathDisabled {
                        camera_id: self.config.id.clone(),
                        path,
                        reason,
                    })
                    .await;
            }
            EncodeError::Failed(reason) => {
                warn!(camera = %self.config.id, path = %path, %reason, "Encode failed");
            }
        }
    }

    /// Close the video session and the device.
    pub async fn close(&mut self) -> Result<(), EncodeError> {
        let video = self.video.finish_part().await;
        if let Err(e) = self.device.close().await {
            warn!(camera = %self.config.id, error = %e, "Device close failed");
        }
        info!(
            camera = %self.config.id,
            video_frames = self.video.total_frames,
            "Pipeline closed"
        );
        video
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::encoder::ImageStillEncoder;
    use crate::camera::SimulatedCamera;
    use crate::config::{Rotation, TriggerSource};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingVideo {
        opened: Mutex<Vec<PathBuf>>,
        frames: Arc<Mutex<u32>>,
        /// Writers behave like an encoder process that already exited
        dead_process: bool,
    }

    struct RecordingWriter {
        frames: Arc<Mutex<u32>>,
        dead_process: bool,
    }

    #[async_trait]
    impl VideoWriter for RecordingWriter {
        async fn write_frame(&mut self, _frame: &Frame) -> Result<(), EncodeError> {
            if self.dead_process {
                let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ffmpeg stdin closed");
                return Err(io.into());
            }
            *self.frames.lock().await += 1;
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<(), EncodeError> {
            Ok(())
        }
    }

    #[async_trait]
    impl VideoEncoder for RecordingVideo {
        async fn open(
            &self,
            path: &Path,
            _geometry: VideoGeometry,
            _profile: &VideoConfig,
        ) -> Result<Box<dyn VideoWriter>, EncodeError> {
            self.opened.lock().await.push(path.to_path_buf());
            Ok(Box::new(RecordingWriter {
                frames: self.frames.clone(),
                dead_process: self.dead_process,
            }))
        }
    }

    struct UnavailableMerger {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl HdrMerger for UnavailableMerger {
        async fn merge(&self, _request: HdrMergeRequest) -> Result<PathBuf, EncodeError> {
            *self.calls.lock().await += 1;
            Err(EncodeError::Unavailable("no merge tool".into()))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        pipeline: CameraPipeline,
        camera: SimulatedCamera,
        video: Arc<RecordingVideo>,
        merger: Arc<UnavailableMerger>,
    }

    fn fixture(config: CameraConfig) -> Fixture {
        fixture_with_video(config, RecordingVideo::default())
    }

    fn fixture_with_video(config: CameraConfig, video: RecordingVideo) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let camera = SimulatedCamera::new(config.id.clone(), 8, 4);
        let video = Arc::new(video);
        let merger = Arc::new(UnavailableMerger {
            calls: Mutex::new(0),
        });
        let encoders = Encoders {
            still: Arc::new(ImageStillEncoder),
            video: video.clone(),
            hdr: merger.clone(),
        };
        let pipeline = CameraPipeline::new(
            config,
            Arc::new(camera.clone()),
            encoders,
            Arc::new(EventBus::default()),
            tmp.path(),
            tmp.path(),
            Duration::from_millis(200),
        );
        Fixture {
            _tmp: tmp,
            pipeline,
            camera,
            video,
            merger,
        }
    }

    fn trigger(seq: u64) -> Arc<TriggerEvent> {
        Arc::new(TriggerEvent::new(seq, TriggerSource::Software))
    }

    fn hdr_config() -> CameraConfig {
        let mut config = CameraConfig::new("port");
        config.hdr_enabled = true;
        config.hdr_brackets = [500, 1000, 2000]
            .iter()
            .map(|&exposure_us| BracketSpec {
                exposure_us,
                gain: 0.0,
                emit_signal: false,
                save_image: true,
            })
            .collect();
        config
    }

    #[test]
    fn test_plan_follows_dividers() {
        let mut config = CameraConfig::new("port");
        config.trigger_divider = 2;
        config.still_divider = 4;
        config.video_enabled = true;
        config.video_divider = 2;

        assert!(CyclePlan::for_sequence(&config, 1).is_none());
        let plan = CyclePlan::for_sequence(&config, 2).unwrap();
        assert!(!plan.save_still);
        assert!(plan.record_video);
        let plan = CyclePlan::for_sequence(&config, 4).unwrap();
        assert!(plan.save_still);
    }

    #[tokio::test]
    async fn test_single_bracket_cycle_writes_still() {
        let mut fx = fixture(CameraConfig::new("port"));
        let plan = CyclePlan {
            save_still: true,
            record_video: false,
        };
        let outcome = fx.pipeline.run_cycle(trigger(3), plan).await;

        assert_eq!(outcome.summary.status, CaptureStatus::Captured);
        assert_eq!(outcome.summary.brackets.len(), 1);
        let path = outcome.summary.brackets[0].still_path.clone().unwrap();
        assert!(path.ends_with("00000003_port_b00.jpg"));
        assert!(path.exists());
        assert!(outcome.preview.is_some());
    }

    #[tokio::test]
    async fn test_hdr_brackets_run_in_order_and_unavailable_merge_disables_path() {
        let mut fx = fixture(hdr_config());
        let plan = CyclePlan {
            save_still: true,
            record_video: false,
        };
        let outcome = fx.pipeline.run_cycle(trigger(0), plan).await;

        assert_eq!(fx.camera.captured_exposures().await, vec![500, 1000, 2000]);
        let indices: Vec<usize> = outcome.summary.brackets.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(fx.pipeline.is_path_disabled(OutputPath::Hdr));

        fx.pipeline.run_cycle(trigger(1), plan).await;
        assert_eq!(*fx.merger.calls.lock().await, 1, "merge must not be retried once unavailable");
    }

    #[tokio::test]
    async fn test_hdr_brackets_captured_without_merge_off_still_cycles() {
        let mut fx = fixture(hdr_config());
        let plan = CyclePlan {
            save_still: false,
            record_video: false,
        };
        let outcome = fx.pipeline.run_cycle(trigger(1), plan).await;

        assert_eq!(outcome.summary.status, CaptureStatus::Captured);
        assert_eq!(fx.camera.captured_exposures().await, vec![500, 1000, 2000]);
        assert_eq!(outcome.summary.brackets.len(), 3);
        assert!(outcome.summary.brackets.iter().all(|b| b.still_path.is_none()));
        assert!(outcome.summary.hdr_path.is_none());
        assert_eq!(*fx.merger.calls.lock().await, 0);
        assert!(!fx.pipeline.is_path_disabled(OutputPath::Hdr));
    }

    #[tokio::test]
    async fn test_failed_bracket_skips_rest_and_merge() {
        let mut fx = fixture(hdr_config());
        fx.camera.fail_next(1).await;
        let plan = CyclePlan {
            save_still: true,
            record_video: false,
        };
        let outcome = fx.pipeline.run_cycle(trigger(0), plan).await;

        assert!(matches!(outcome.summary.status, CaptureStatus::Failed { .. }));
        assert_eq!(outcome.summary.brackets[0].error.as_deref(), Some("device-error"));
        assert_eq!(outcome.summary.brackets[2].error.as_deref(), Some("skipped"));
        assert_eq!(*fx.merger.calls.lock().await, 0);
        assert!(fx.camera.captured_exposures().await.is_empty());
    }

    #[tokio::test]
    async fn test_capture_timeout_is_reported() {
        let mut fx = fixture(CameraConfig::new("port"));
        fx.camera.set_unresponsive(true).await;
        let plan = CyclePlan {
            save_still: false,
            record_video: false,
        };
        let outcome = fx.pipeline.run_cycle(trigger(0), plan).await;
        assert_eq!(outcome.error, Some(CaptureError::Timeout(200)));
    }

    #[tokio::test]
    async fn test_video_rolls_over_after_max_frames() {
        let mut config = CameraConfig::new("port");
        config.video_enabled = true;
        config.video.max_frames_per_file = 2;
        let mut fx = fixture(config);
        let plan = CyclePlan {
            save_still: false,
            record_video: true,
        };
        for seq in 0..5 {
            let outcome = fx.pipeline.run_cycle(trigger(seq), plan).await;
            assert!(outcome.summary.video_frame);
        }
        fx.pipeline.close().await.unwrap();

        let opened = fx.video.opened.lock().await.clone();
        assert_eq!(opened.len(), 3);
        assert!(opened[2].ends_with("port_0002.mp4"));
        assert_eq!(*fx.video.frames.lock().await, 5);
        assert!(fx.camera.is_closed().await);
    }

    #[tokio::test]
    async fn test_dead_video_encoder_disables_path() {
        let mut config = CameraConfig::new("port");
        config.video_enabled = true;
        let video = RecordingVideo {
            dead_process: true,
            ..RecordingVideo::default()
        };
        let mut fx = fixture_with_video(config, video);
        let plan = CyclePlan {
            save_still: false,
            record_video: true,
        };

        let outcome = fx.pipeline.run_cycle(trigger(0), plan).await;
        assert_eq!(outcome.summary.status, CaptureStatus::Captured);
        assert!(!outcome.summary.video_frame);
        assert!(fx.pipeline.is_path_disabled(OutputPath::Video));

        for seq in 1..4 {
            let outcome = fx.pipeline.run_cycle(trigger(seq), plan).await;
            assert!(!outcome.summary.video_frame);
        }
        assert_eq!(fx.video.opened.lock().await.len(), 1);
        fx.pipeline.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_config_reconfigures_device_only_when_asked() {
        let mut fx = fixture(CameraConfig::new("port"));

        let mut relabelled = fx.pipeline.config().clone();
        relabelled.label = "Port side".into();
        fx.pipeline.apply_config(relabelled, false).await.unwrap();
        assert_eq!(fx.pipeline.config().label, "Port side");
        assert_eq!(fx.camera.configure_calls().await, 0);

        let mut longer = fx.pipeline.config().clone();
        longer.exposure_us = 8000;
        fx.pipeline.apply_config(longer, true).await.unwrap();
        assert_eq!(fx.camera.configure_calls().await, 1);
        assert_eq!(fx.camera.configured().await.0, 8000);
    }

    #[tokio::test]
    async fn test_rotation_applied_before_save() {
        let mut config = CameraConfig::new("port");
        config.rotation = Rotation::Cw90;
        let mut fx = fixture(config);
        let plan = CyclePlan {
            save_still: true,
            record_video: false,
        };
        let outcome = fx.pipeline.run_cycle(trigger(0), plan).await;
        let preview = outcome.preview.unwrap();
        assert_eq!((preview.width, preview.height), (4, 8));
        let path = outcome.summary.brackets[0].still_path.clone().unwrap();
        let saved = image::open(path).unwrap();
        assert_eq!((saved.width(), saved.height()), (4, 8));
    }
}
