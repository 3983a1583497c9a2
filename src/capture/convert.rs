//! Raw sensor bytes to canonical RGB frames.

use image::{DynamicImage, GrayImage};
use tracing::trace;

use super::frame::{BayerPattern, CanonicalFrame, PixelFormat, RawFrame};
use crate::error::DeviceError;

/// Frames whose brightest sample is below this get a min-max stretch.
pub const DIM_FRAME_THRESHOLD: u8 = 100;

pub fn to_canonical(raw: &RawFrame<'_>, gain: f32) -> Result<CanonicalFrame, DeviceError> {
    let mut luma = reshape(raw)?;

    if luma.iter().copied().max().unwrap_or(0) < DIM_FRAME_THRESHOLD {
        normalize_min_max(&mut luma);
    }
    if gain != 1.0 {
        apply_gain(&mut luma, gain);
    }

    Ok(CanonicalFrame {
        image: DynamicImage::ImageLuma8(luma).to_rgb8(),
        device_sequence: raw.sequence,
        device_timestamp: raw.device_timestamp,
    })
}

/// Validate geometry and produce one 8-bit luminance sample per pixel.
fn reshape(raw: &RawFrame<'_>) -> Result<GrayImage, DeviceError> {
    let samples = raw.width as usize * raw.height as usize;
    if samples == 0 {
        return Err(DeviceError::Decode(format!(
            "empty frame {}x{}",
            raw.width, raw.height
        )));
    }
    if raw.frame_len > raw.data.len() {
        return Err(DeviceError::Decode(format!(
            "declared length {} exceeds buffer of {}",
            raw.frame_len,
            raw.data.len()
        )));
    }
    if raw.frame_len != samples {
        return Err(DeviceError::Decode(format!(
            "{:?} frame of {} bytes cannot be reshaped to {}x{}",
            raw.format, raw.frame_len, raw.width, raw.height
        )));
    }

    let payload = raw.payload();
    let samples = match raw.format {
        PixelFormat::Mono8 => payload.to_vec(),
        PixelFormat::Other(code) => {
            trace!(code, "unrecognized pixel format, treating as 8-bit mono");
            payload.to_vec()
        }
        format => match format.bayer_pattern() {
            Some(pattern) => bayer_to_luma(
                payload,
                raw.width as usize,
                raw.height as usize,
                pattern,
            ),
            None => payload.to_vec(),
        },
    };
    GrayImage::from_raw(raw.width, raw.height, samples)
        .ok_or_else(|| DeviceError::Decode("luma buffer does not match geometry".into()))
}

#[derive(Clone, Copy)]
enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

fn cfa_channel(pattern: BayerPattern, x: usize, y: usize) -> Channel {
    use Channel::*;
    let cell = match pattern {
        BayerPattern::Rggb => [[Red, Green], [Green, Blue]],
        BayerPattern::Grbg => [[Green, Red], [Blue, Green]],
        BayerPattern::Gbrg => [[Green, Blue], [Red, Green]],
        BayerPattern::Bggr => [[Blue, Green], [Green, Red]],
    };
    cell[y & 1][x & 1]
}

/// Bilinear demosaic followed by BT.601 luma.
fn bayer_to_luma(mosaic: &[u8], width: usize, height: usize, pattern: BayerPattern) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height);
    for y in 0..height {
        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(height - 1);
        for x in 0..width {
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);

            let mut sum = [0u32; 3];
            let mut count = [0u32; 3];
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let ch = cfa_channel(pattern, nx, ny) as usize;
                    sum[ch] += u32::from(mosaic[ny * width + nx]);
                    count[ch] += 1;
                }
            }
            let center = cfa_channel(pattern, x, y) as usize;
            let value = u32::from(mosaic[y * width + x]);
            let mut rgb = [0u32; 3];
            for ch in 0..3 {
                rgb[ch] = if ch == center {
                    value
                } else if count[ch] > 0 {
                    (sum[ch] + count[ch] / 2) / count[ch]
                } else {
                    value
                };
            }
            let luma = (299 * rgb[0] + 587 * rgb[1] + 114 * rgb[2] + 500) / 1000;
            out.push(luma.min(255) as u8);
        }
    }
    out
}

/// Stretch to the full 0..=255 range. A constant frame maps to zero.
fn normalize_min_max(samples: &mut [u8]) {
    let (min, max) = samples
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if max <= min {
        samples.fill(0);
        return;
    }
    let scale = 255.0 / f32::from(max - min);
    for v in samples.iter_mut() {
        *v = (f32::from(*v - min) * scale).round().min(255.0) as u8;
    }
}

/// Multiply and saturate, no wraparound.
fn apply_gain(samples: &mut [u8], gain: f32) {
    for v in samples.iter_mut() {
        *v = (f32::from(*v) * gain).abs().round().clamp(0.0, 255.0) as u8;
    }
}
