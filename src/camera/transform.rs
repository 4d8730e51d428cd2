//! Pure geometric transforms on frames.
//!
//! Rotation runs before any save or encode step. Scaling uses the `image`
//! crate's resampler and is applied by the encoders and the protocol server.

use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage};

use crate::config::Rotation;
use crate::core::Frame;

/// Apply `rotation` to `frame`. `Rotation::None` returns a cheap clone.
pub fn rotate(frame: &Frame, rotation: Rotation) -> Frame {
    if rotation == Rotation::None {
        return frame.clone();
    }

    let w = frame.width as usize;
    let h = frame.height as usize;
    let c = frame.channels as usize;
    let src = &frame.pixels;
    let mut dst = vec![0u8; src.len()];

    let (out_w, out_h) = match rotation {
        Rotation::Cw90 | Rotation::Cw270 => (h, w),
        _ => (w, h),
    };

    for y in 0..h {
        for x in 0..w {
            let (dx, dy) = match rotation {
                Rotation::None => (x, y),
                Rotation::Cw90 => (h - 1 - y, x),
                Rotation::Cw180 => (w - 1 - x, h - 1 - y),
                Rotation::Cw270 => (y, w - 1 - x),
                Rotation::FlipLr => (w - 1 - x, y),
                Rotation::FlipUd => (x, h - 1 - y),
            };
            let s = (y * w + x) * c;
            let d = (dy * out_w + dx) * c;
            dst[d..d + c].copy_from_slice(&src[s..s + c]);
        }
    }

    Frame {
        width: out_w as u32,
        height: out_h as u32,
        channels: frame.channels,
        pixels: dst.into(),
    }
}

/// Wrap a frame as an `image` buffer.
pub fn to_image(frame: &Frame) -> Option<DynamicImage> {
    let data = frame.pixels.to_vec();
    match frame.channels {
        1 => GrayImage::from_raw(frame.width, frame.height, data).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(frame.width, frame.height, data).map(DynamicImage::ImageRgb8),
        _ => None,
    }
}

/// Convert an 8-bit `image` buffer back to a frame.
pub fn from_image(image: DynamicImage) -> Frame {
    match image {
        DynamicImage::ImageLuma8(img) => Frame {
            width: img.width(),
            height: img.height(),
            channels: 1,
            pixels: img.into_raw().into(),
        },
        other => {
            let img = other.into_rgb8();
            Frame {
                width: img.width(),
                height: img.height(),
                channels: 3,
                pixels: img.into_raw().into(),
            }
        }
    }
}

/// Resize by `percent` (100 = unchanged). Dimensions never drop below 1.
pub fn scale(frame: &Frame, percent: f64) -> Frame {
    if !(percent > 0.0) || (percent - 100.0).abs() < f64::EPSILON {
        return frame.clone();
    }
    let factor = percent / 100.0;
    let width = ((frame.width as f64 * factor).round() as u32).max(1);
    let height = ((frame.height as f64 * factor).round() as u32).max(1);
    if width == frame.width && height == frame.height {
        return frame.clone();
    }
    match to_image(frame) {
        Some(img) => from_image(img.resize_exact(width, height, FilterType::Triangle)),
        None => frame.clone(),
    }
}
