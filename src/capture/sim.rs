//! Simulated device link for running and testing without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::frame::{PixelFormat, RawFrame, ScratchBuffer};
use crate::capture::link::{DeviceDescriptor, DeviceLink, DeviceSession};
use crate::error::DeviceError;

/// Synthetic image content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Horizontal ramp 0..=255.
    Gradient,
    /// Horizontal ramp 0..=`max`, used to exercise the exposure stretch.
    Dim(u8),
    Solid(u8),
}

/// One scripted outcome of `read_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStep {
    Frame,
    Timeout,
    IoError,
    /// A frame whose declared length disagrees with its geometry.
    Truncated,
}

/// Counters observable from tests.
#[derive(Debug, Default)]
pub struct SimProbe {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub reads: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SimulatedLink {
    width: u32,
    height: u32,
    format: PixelFormat,
    pattern: TestPattern,
    frame_interval: Duration,
    script: Vec<SimStep>,
    present: bool,
    busy: bool,
    probe: Arc<SimProbe>,
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl SimulatedLink {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Mono8,
            pattern: TestPattern::Gradient,
            frame_interval: Duration::ZERO,
            script: Vec::new(),
            present: true,
            busy: false,
            probe: Arc::new(SimProbe::default()),
        }
    }

    /// A link that enumerates no devices.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::default()
        }
    }

    /// A link whose device refuses to start grabbing.
    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Pace reads like a real sensor would.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Steps replayed before the link falls back to producing frames.
    pub fn with_script(mut self, script: impl IntoIterator<Item = SimStep>) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        Arc::clone(&self.probe)
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: "sim0".into(),
            label: format!("Simulated camera {}x{}", self.width, self.height),
            path: "sim://0".into(),
        }
    }
}

impl DeviceLink for SimulatedLink {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        if !self.present {
            return Ok(Vec::new());
        }
        Ok(vec![self.descriptor()])
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceSession>, DeviceError> {
        if !self.present || *descriptor != self.descriptor() {
            return Err(DeviceError::Unavailable(format!(
                "no simulated device {}",
                descriptor.id
            )));
        }
        self.probe.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimulatedSession {
            width: self.width,
            height: self.height,
            format: self.format,
            pattern: self.pattern,
            frame_interval: self.frame_interval,
            script: self.script.iter().copied().collect(),
            busy: self.busy,
            grabbing: false,
            closed: false,
            sequence: 0,
            last_read: None,
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct SimulatedSession {
    width: u32,
    height: u32,
    format: PixelFormat,
    pattern: TestPattern,
    frame_interval: Duration,
    script: VecDeque<SimStep>,
    busy: bool,
    grabbing: bool,
    closed: bool,
    sequence: u64,
    last_read: Option<Instant>,
    probe: Arc<SimProbe>,
}

impl SimulatedSession {
    fn pace(&mut self) {
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }
}

impl DeviceSession for SimulatedSession {
    fn start_capture(&mut self) -> Result<(), DeviceError> {
        if self.busy {
            return Err(DeviceError::Busy("simulated device is busy".into()));
        }
        self.grabbing = true;
        Ok(())
    }

    fn read_frame<'a>(
        &mut self,
        scratch: &'a mut ScratchBuffer,
        _timeout: Duration,
    ) -> Result<RawFrame<'a>, DeviceError> {
        if !self.grabbing {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is not grabbing",
            )));
        }
        self.probe.reads.fetch_add(1, Ordering::Relaxed);

        let step = self.script.pop_front().unwrap_or(SimStep::Frame);
        match step {
            SimStep::Timeout => return Err(DeviceError::Timeout),
            SimStep::IoError => {
                return Err(DeviceError::Io(io::Error::other("simulated read failure")))
            }
            SimStep::Frame | SimStep::Truncated => {}
        }

        self.pace();
        let len = self.width as usize * self.height as usize;
        if len > scratch.capacity() {
            return Err(DeviceError::Io(io::Error::other(format!(
                "frame of {len} bytes exceeds {} byte scratch buffer",
                scratch.capacity()
            ))));
        }
        fill_pattern(
            &mut scratch.as_mut_slice()[..len],
            self.width,
            self.pattern,
        );

        self.sequence += 1;
        let frame_len = if step == SimStep::Truncated { len / 2 } else { len };
        Ok(RawFrame {
            data: scratch.as_slice(),
            width: self.width,
            height: self.height,
            format: self.format,
            frame_len,
            sequence: self.sequence,
            device_timestamp: Some(Duration::from_millis(self.sequence * 33)),
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.grabbing = false;
        self.probe.closed.fetch_add(1, Ordering::Relaxed);
        debug!(frames = self.sequence, "simulated session closed");
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn fill_pattern(data: &mut [u8], width: u32, pattern: TestPattern) {
    let width = width.max(1) as usize;
    match pattern {
        TestPattern::Solid(value) => data.fill(value),
        TestPattern::Gradient => ramp(data, width, 255),
        TestPattern::Dim(max) => ramp(data, width, max),
    }
}

fn ramp(data: &mut [u8], width: usize, max: u8) {
    let span = (width - 1).max(1);
    for row in data.chunks_mut(width) {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x * usize::from(max)) / span) as u8;
        }
    }
}
