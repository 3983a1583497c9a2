//! V4L2 device link for monochrome and raw Bayer industrial cameras.

use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{PixelFormat, RawFrame, ScratchBuffer};
use crate::capture::link::{DeviceDescriptor, DeviceLink, DeviceSession};
use crate::error::DeviceError;
use crate::CameraConfig;

/// Requested stream geometry for V4L2 devices.
#[derive(Debug, Clone)]
pub struct V4l2Settings {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

impl From<&CameraConfig> for V4l2Settings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            format: config.format,
            buffer_count: config.buffer_count,
        }
    }
}

const EBUSY: i32 = 16;

pub struct V4l2Link {
    settings: V4l2Settings,
}

impl V4l2Link {
    pub fn new(settings: V4l2Settings) -> Self {
        Self { settings }
    }
}

fn fourcc_for(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Mono8 => Some(FourCC::new(b"GREY")),
        PixelFormat::BayerRg8 => Some(FourCC::new(b"RGGB")),
        PixelFormat::BayerGr8 => Some(FourCC::new(b"GRBG")),
        PixelFormat::BayerGb8 => Some(FourCC::new(b"GBRG")),
        PixelFormat::BayerBg8 => Some(FourCC::new(b"BA81")),
        PixelFormat::Other(_) => None,
    }
}

fn format_for(fourcc: FourCC) -> PixelFormat {
    match &fourcc.repr {
        b"GREY" | b"Y800" => PixelFormat::Mono8,
        b"RGGB" => PixelFormat::BayerRg8,
        b"GRBG" => PixelFormat::BayerGr8,
        b"GBRG" => PixelFormat::BayerGb8,
        b"BA81" => PixelFormat::BayerBg8,
        other => PixelFormat::Other(u32::from_le_bytes(*other)),
    }
}

impl DeviceLink for V4l2Link {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let mut found = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_path_buf();
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }
            debug!("Found capture device: {} - {}", path.display(), caps.card);
            found.push(DeviceDescriptor {
                id: format!("video{}", node.index()),
                label: caps.card,
                path: path.display().to_string(),
            });
        }
        Ok(found)
    }

    #[instrument(skip(self))]
    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let unavailable = |err: io::Error| {
            DeviceError::Unavailable(format!("{}: {}", descriptor.path, err))
        };

        let device = Device::with_path(Path::new(&descriptor.path)).map_err(unavailable)?;
        let caps = device.query_caps().map_err(unavailable)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Unavailable(format!(
                "{} doesn't support video capture",
                descriptor.path
            )));
        }

        let mut fmt = device.format().map_err(unavailable)?;
        fmt.width = self.settings.width;
        fmt.height = self.settings.height;
        if let Some(fourcc) = fourcc_for(self.settings.format) {
            fmt.fourcc = fourcc;
        }
        let fmt = device.set_format(&fmt).map_err(unavailable)?;
        if fmt.width != self.settings.width || fmt.height != self.settings.height {
            warn!(
                "Driver negotiated {}x{} instead of {}x{}",
                fmt.width, fmt.height, self.settings.width, self.settings.height
            );
        }

        Ok(Box::new(V4l2Session {
            device,
            stream: None,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format: format_for(fmt.fourcc),
            buffer_count: self.settings.buffer_count,
        }))
    }
}

struct V4l2Session {
    device: Device,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    /// Bytes per line as negotiated with the driver.
    stride: u32,
    format: PixelFormat,
    buffer_count: u32,
}

impl DeviceSession for V4l2Session {
    fn start_capture(&mut self) -> Result<(), DeviceError> {
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(|err| match err.raw_os_error() {
                Some(EBUSY) => DeviceError::Busy(err.to_string()),
                _ => DeviceError::Io(err),
            })?;
        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers ({}x{} {:?})",
            self.buffer_count, self.width, self.height, self.format
        );
        Ok(())
    }

    fn read_frame<'a>(
        &mut self,
        scratch: &'a mut ScratchBuffer,
        timeout: Duration,
    ) -> Result<RawFrame<'a>, DeviceError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            DeviceError::Io(io::Error::new(io::ErrorKind::NotConnected, "stream not started"))
        })?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DeviceError::Timeout,
            _ => DeviceError::Io(err),
        })?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let stride = match self.format {
            PixelFormat::Other(_) => 0,
            _ => self.stride as usize,
        };
        let frame_len = copy_unpadded(
            &buf[..used],
            self.width as usize,
            self.height as usize,
            stride,
            scratch.as_mut_slice(),
        )?;

        let secs = meta.timestamp.sec.max(0) as u64;
        let micros = meta.timestamp.usec.max(0) as u64;
        Ok(RawFrame {
            data: scratch.as_slice(),
            width: self.width,
            height: self.height,
            format: self.format,
            frame_len,
            sequence: u64::from(meta.sequence),
            device_timestamp: Some(Duration::from_secs(secs) + Duration::from_micros(micros)),
        })
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Capture stream stopped");
        }
    }
}

/// Copy one 8-bit frame into `dst`, dropping per-line padding when the
/// driver's stride is wider than the image. Returns the bytes written.
fn copy_unpadded(
    src: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    dst: &mut [u8],
) -> Result<usize, DeviceError> {
    let padded = stride > width && height > 0 && src.len() >= stride * (height - 1) + width;
    let len = if padded { width * height } else { src.len() };
    if len > dst.len() {
        return Err(DeviceError::Io(io::Error::other(format!(
            "frame of {len} bytes exceeds {} byte scratch buffer",
            dst.len()
        ))));
    }

    if padded {
        for (row, line) in dst[..len].chunks_exact_mut(width).enumerate() {
            let start = row * stride;
            line.copy_from_slice(&src[start..start + width]);
        }
    } else {
        dst[..len].copy_from_slice(src);
    }
    Ok(len)
}
