use std::time::{Duration, SystemTime};

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Default scratch capacity, large enough for a 20 MP mono sensor.
pub const DEFAULT_SCRATCH_BYTES: usize = 20 * 1024 * 1024;

/// Pixel layouts a device link can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Mono8,
    BayerRg8,
    BayerGr8,
    BayerGb8,
    BayerBg8,
    /// Vendor or fourcc code we have no decoder for.
    Other(u32),
}

impl PixelFormat {
    /// Colour of the top-left 2x2 cell for Bayer layouts, `None` otherwise.
    pub fn bayer_pattern(self) -> Option<BayerPattern> {
        match self {
            PixelFormat::BayerRg8 => Some(BayerPattern::Rggb),
            PixelFormat::BayerGr8 => Some(BayerPattern::Grbg),
            PixelFormat::BayerGb8 => Some(BayerPattern::Gbrg),
            PixelFormat::BayerBg8 => Some(BayerPattern::Bggr),
            PixelFormat::Mono8 | PixelFormat::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

/// Reusable read buffer owned by the capture loop.
///
/// Device links write into it and hand back a [`RawFrame`] that borrows it,
/// so raw bytes can never outlive the conversion step.
pub struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SCRATCH_BYTES)
    }
}

/// One unprocessed frame as reported by the device link.
#[derive(Debug)]
pub struct RawFrame<'a> {
    /// Whole scratch region; only the first `frame_len` bytes are meaningful.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_len: usize,
    pub sequence: u64,
    pub device_timestamp: Option<Duration>,
}

impl RawFrame<'_> {
    /// Bytes the device declared as belonging to this frame.
    pub fn payload(&self) -> &[u8] {
        let len = self.frame_len.min(self.data.len());
        &self.data[..len]
    }
}

/// Decoded, normalized, gain-applied presentation frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFrame {
    pub image: RgbImage,
    pub device_sequence: u64,
    pub device_timestamp: Option<Duration>,
}

impl CanonicalFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn max_sample(&self) -> u8 {
        self.image.as_raw().iter().copied().max().unwrap_or(0)
    }
}

/// Current entry of the frame cache.
#[derive(Debug)]
pub struct CachedFrame {
    pub sequence: u64,
    pub captured_at: SystemTime,
    pub frame: CanonicalFrame,
}
