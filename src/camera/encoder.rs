//! Encoder seams for still, video and HDR output.
//!
//! Codec internals live outside this crate:
//!
//! - `ImageStillEncoder` writes stills with the `image` crate on the blocking pool
//! - `FfmpegVideoEncoder` pipes raw frames into an external `ffmpeg` process
//! - `ExternalHdrMerger` pipes bracket frames into an external merge tool
//!
//! A missing executable surfaces as `EncodeError::Unavailable`, which the
//! pipeline turns into a disabled path for the rest of the run.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info};

use crate::camera::transform;
use crate::config::{HdrMergeMethod, StillConfig, TonemapConfig, VideoConfig};
use crate::core::Frame;
use crate::error::EncodeError;

// =============================================================================
// Stills
// =============================================================================

/// Writes one frame as a still image.
#[async_trait]
pub trait StillEncoder: Send + Sync {
    async fn encode(&self, frame: &Frame, path: &Path, options: &StillConfig) -> Result<(), EncodeError>;
}

/// Still encoder backed by the `image` crate.
#[derive(Debug, Default, Clone)]
pub struct ImageStillEncoder;

impl ImageStillEncoder {
    fn encode_blocking(frame: Frame, path: PathBuf, options: StillConfig) -> Result<(), EncodeError> {
        let frame = transform::scale(&frame, options.scale);
        let img = transform::to_image(&frame)
            .ok_or_else(|| EncodeError::Failed("frame geometry does not match buffer".into()))?;

        match options.normalized_extension().as_str() {
            "jpg" | "jpeg" => {
                let file = std::fs::File::create(&path)?;
                let mut writer = std::io::BufWriter::new(file);
                write_jpeg(&mut writer, &frame, options.jpeg_quality)?;
                writer.flush()?;
            }
            ext => {
                let format = image::ImageFormat::from_extension(ext)
                    .ok_or_else(|| EncodeError::Unavailable(format!("no encoder for '.{}'", ext)))?;
                img.save_with_format(&path, format)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StillEncoder for ImageStillEncoder {
    async fn encode(&self, frame: &Frame, path: &Path, options: &StillConfig) -> Result<(), EncodeError> {
        let frame = frame.clone();
        let path = path.to_path_buf();
        let options = options.clone();
        tokio::task::spawn_blocking(move || Self::encode_blocking(frame, path, options))
            .await
            .map_err(|e| EncodeError::Failed(format!("encoder task failed: {}", e)))?
    }
}

fn write_jpeg<W: Write>(writer: W, frame: &Frame, quality: u8) -> Result<(), EncodeError> {
    let color = match frame.channels {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        n => return Err(EncodeError::Failed(format!("unsupported channel count {}", n))),
    };
    let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    encoder.encode(&frame.pixels, frame.width, frame.height, color)?;
    Ok(())
}

/// Encode a frame to JPEG bytes in memory.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    write_jpeg(&mut bytes, frame, quality)?;
    Ok(bytes)
}

// =============================================================================
// Video
// =============================================================================

/// Geometry of the frames written to one video file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl VideoGeometry {
    pub fn of(frame: &Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
        }
    }
}

/// Opens video files.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        geometry: VideoGeometry,
        profile: &VideoConfig,
    ) -> Result<Box<dyn VideoWriter>, EncodeError>;
}

/// One open video file.
#[async_trait]
pub trait VideoWriter: Send + Sync {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), EncodeError>;
    /// Flush and close the file.
    async fn finish(self: Box<Self>) -> Result<(), EncodeError>;
}

/// Video encoder that spawns `ffmpeg` reading raw frames from stdin.
#[derive(Debug, Clone)]
pub struct FfmpegVideoEncoder {
    command: String,
}

impl FfmpegVideoEncoder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn args(path: &Path, geometry: VideoGeometry, profile: &VideoConfig) -> Vec<String> {
        let input_format = if geometry.channels == 1 { "gray" } else { "rgb24" };
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            input_format.into(),
            "-s".into(),
            format!("{}x{}", geometry.width, geometry.height),
            "-r".into(),
            profile.framerate.to_string(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            profile.codec.clone(),
            "-b:v".into(),
            profile.bitrate.to_string(),
            "-pix_fmt".into(),
            profile.pixel_format.clone(),
            path.display().to_string(),
        ]
    }
}

#[async_trait]
impl VideoEncoder for FfmpegVideoEncoder {
    async fn open(
        &self,
        path: &Path,
        geometry: VideoGeometry,
        profile: &VideoConfig,
    ) -> Result<Box<dyn VideoWriter>, EncodeError> {
        let mut child = Command::new(&self.command)
            .args(Self::args(path, geometry, profile))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncodeError::Failed("encoder stdin unavailable".into()))?;
        info!(path = %path.display(), "Opened video file");
        Ok(Box::new(FfmpegWriter {
            child,
            stdin: Some(stdin),
            geometry,
            path: path.to_path_buf(),
        }))
    }
}

struct FfmpegWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    geometry: VideoGeometry,
    path: PathBuf,
}

#[async_trait]
impl VideoWriter for FfmpegWriter {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), EncodeError> {
        if VideoGeometry::of(frame) != self.geometry {
            return Err(EncodeError::Failed(format!(
                "frame {}x{}x{} does not match video geometry {:?}",
                frame.width, frame.height, frame.channels, self.geometry
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncodeError::Failed("video file already closed".into()))?;
        stdin.write_all(&frame.pixels).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), EncodeError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        let status = self.child.wait().await?;
        if status.success() {
            debug!(path = %self.path.display(), "Closed video file");
            Ok(())
        } else {
            Err(EncodeError::Failed(format!(
                "video encoder exited with {} for {}",
                status,
                self.path.display()
            )))
        }
    }
}

// =============================================================================
// HDR
// =============================================================================

/// Inputs of one HDR merge, in bracket order.
#[derive(Debug, Clone)]
pub struct HdrMergeRequest {
    pub frames: Vec<Frame>,
    pub exposures_us: Vec<u32>,
    pub method: HdrMergeMethod,
    pub tonemap: TonemapConfig,
    pub output: PathBuf,
}

/// Combines an ordered bracket sequence into one image.
#[async_trait]
pub trait HdrMerger: Send + Sync {
    async fn merge(&self, request: HdrMergeRequest) -> Result<PathBuf, EncodeError>;
}

/// HDR merger that pipes concatenated raw frames into an external tool.
///
/// Command line:
/// `<tool> --method M --width W --height H --channels C --exposures e1,e2,..
///  --gamma G --saturation S --bias B --output PATH`
#[derive(Debug, Clone)]
pub struct ExternalHdrMerger {
    command: String,
}

impl ExternalHdrMerger {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl HdrMerger for ExternalHdrMerger {
    async fn merge(&self, request: HdrMergeRequest) -> Result<PathBuf, EncodeError> {
        let first = request
            .frames
            .first()
            .ok_or_else(|| EncodeError::Failed("no frames to merge".into()))?;
        let geometry = VideoGeometry::of(first);
        if request.frames.iter().any(|f| VideoGeometry::of(f) != geometry) {
            return Err(EncodeError::Failed("bracket frames differ in geometry".into()));
        }

        let exposures = request
            .exposures_us
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut child = Command::new(&self.command)
            .arg("--method")
            .arg(request.method.as_str())
            .arg("--width")
            .arg(geometry.width.to_string())
            .arg("--height")
            .arg(geometry.height.to_string())
            .arg("--channels")
            .arg(geometry.channels.to_string())
            .arg("--exposures")
            .arg(exposures)
            .arg("--gamma")
            .arg(request.tonemap.gamma.to_string())
            .arg("--saturation")
            .arg(request.tonemap.saturation.to_string())
            .arg("--bias")
            .arg(request.tonemap.bias.to_string())
            .arg("--output")
            .arg(&request.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            for frame in &request.frames {
                stdin.write_all(&frame.pixels).await?;
            }
            stdin.shutdown().await?;
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(request.output)
        } else {
            Err(EncodeError::Failed(format!("merge tool exited with {}", status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32) -> Frame {
        let pixels: Vec<u8> = (0..width * height).map(|i| (i % 256) as u8).collect();
        Frame::new(width, height, 1, pixels).unwrap()
    }

    #[tokio::test]
    async fn test_still_encoder_writes_jpeg_and_png() {
        let tmp = tempfile::tempdir().unwrap();
        let encoder = ImageStillEncoder;

        let jpg = tmp.path().join("a.jpg");
        encoder.encode(&gray(16, 8), &jpg, &StillConfig::default()).await.unwrap();
        let bytes = std::fs::read(&jpg).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");

        let png = tmp.path().join("a.png");
        let options = StillConfig {
            extension: "png".into(),
            scale: 50.0,
            ..StillConfig::default()
        };
        encoder.encode(&gray(16, 8), &png, &options).await.unwrap();
        let decoded = image::open(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
    }

    #[test]
    fn test_encode_jpeg_in_memory() {
        let bytes = encode_jpeg(&gray(8, 8), 75).unwrap();
        assert!(bytes.len() > 4);
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_missing_video_tool_is_unavailable() {
        let encoder = FfmpegVideoEncoder::new("definitely-not-an-encoder-7f3a");
        let result = encoder
            .open(
                Path::new("/tmp/never.mp4"),
                VideoGeometry::of(&gray(4, 4)),
                &VideoConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(EncodeError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_merge_tool_is_unavailable() {
        let merger = ExternalHdrMerger::new("definitely-not-a-merger-7f3a");
        let result = merger
            .merge(HdrMergeRequest {
                frames: vec![gray(4, 4), gray(4, 4)],
                exposures_us: vec![1000, 4000],
                method: HdrMergeMethod::Mertens,
                tonemap: TonemapConfig::default(),
                output: PathBuf::from("/tmp/never.hdr"),
            })
            .await;
        assert!(matches!(result, Err(EncodeError::Unavailable(_))));
    }

    #[test]
    fn test_ffmpeg_args_describe_raw_input() {
        let args = FfmpegVideoEncoder::args(
            Path::new("out.mp4"),
            VideoGeometry {
                width: 640,
                height: 480,
                channels: 3,
            },
            &VideoConfig::default(),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-pix_fmt rgb24"));
        assert!(joined.contains("-s 640x480"));
        assert!(joined.contains("-c:v mpeg4"));
        assert!(joined.ends_with("out.mp4"));
    }
}
