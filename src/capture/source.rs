//! Background capture loop: device link -> canonical frame -> frame cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, info_span, instrument, warn};

use crate::capture::convert;
use crate::capture::frame::{CachedFrame, ScratchBuffer, DEFAULT_SCRATCH_BYTES};
use crate::capture::link::{select_device, DeviceDescriptor, DeviceLink, DeviceSession};
use crate::control::ControlSurface;
use crate::error::DeviceError;
use crate::pipeline::FrameCache;
use crate::CameraConfig;

/// Tunables for the capture loop.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Device id or path to open; first enumerated device when `None`.
    pub device: Option<String>,
    pub read_timeout: Duration,
    pub failure_backoff: Duration,
    /// Emit one warning per this many consecutive failures; 0 acts as 1.
    pub failure_report_every: u64,
    pub scratch_bytes: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: None,
            read_timeout: Duration::from_millis(1000),
            failure_backoff: Duration::from_millis(10),
            failure_report_every: 100,
            scratch_bytes: DEFAULT_SCRATCH_BYTES,
        }
    }
}

impl From<&CameraConfig> for CaptureSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            device: config.device.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            failure_backoff: Duration::from_millis(config.failure_backoff_ms),
            failure_report_every: config.failure_report_every.max(1),
            scratch_bytes: config.scratch_bytes,
        }
    }
}

#[derive(Default)]
struct LoopStats {
    frames_published: AtomicU64,
    read_failures: AtomicU64,
    decode_failures: AtomicU64,
    failure_reports: AtomicU64,
}

/// Counters describing the capture loop since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_published: u64,
    pub read_failures: u64,
    pub decode_failures: u64,
    pub failure_reports: u64,
}

struct Worker {
    handle: JoinHandle<()>,
    device: DeviceDescriptor,
}

/// Owns the device link and at most one capture thread.
pub struct FrameSource {
    link: Mutex<Box<dyn DeviceLink>>,
    settings: CaptureSettings,
    control: Arc<ControlSurface>,
    cache: Arc<FrameCache>,
    stats: Arc<CachePadded<LoopStats>>,
    worker: Mutex<Option<Worker>>,
}

impl FrameSource {
    pub fn new(
        link: Box<dyn DeviceLink>,
        settings: CaptureSettings,
        control: Arc<ControlSurface>,
        cache: Arc<FrameCache>,
    ) -> Self {
        Self {
            link: Mutex::new(link),
            settings,
            control,
            cache,
            stats: Arc::new(CachePadded::new(LoopStats::default())),
            worker: Mutex::new(None),
        }
    }

    /// Open the device and launch the capture loop.
    ///
    /// On failure the source stays stopped and the error is returned; there
    /// is no internal retry. Calling this while running is a no-op.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), DeviceError> {
        let mut worker = lock(&self.worker);
        match worker.take() {
            Some(live) if !live.handle.is_finished() => {
                debug!("capture loop already running");
                *worker = Some(live);
                return Ok(());
            }
            Some(dead) => {
                if dead.handle.join().is_err() {
                    error!("Capture thread for {} panicked", dead.device.id);
                }
            }
            None => {}
        }

        let (session, device) = match self.open_session() {
            Ok(opened) => opened,
            Err(err) => {
                error!("Failed to start camera: {}", err);
                self.control.set_running(false);
                return Err(err);
            }
        };

        self.control.set_running(true);
        let ctx = LoopContext {
            settings: self.settings.clone(),
            control: Arc::clone(&self.control),
            cache: Arc::clone(&self.cache),
            stats: Arc::clone(&self.stats),
            device_id: device.id.clone(),
        };
        // The session moves with the closure; if spawning fails the closure
        // is dropped and the session's Drop releases the device.
        let spawned = thread::Builder::new()
            .name("qc-capture".into())
            .spawn(move || run_capture_loop(session, ctx));

        match spawned {
            Ok(handle) => {
                info!("Capture started on {} ({})", device.label, device.path);
                *worker = Some(Worker { handle, device });
                Ok(())
            }
            Err(err) => {
                error!("Failed to spawn capture thread: {}", err);
                self.control.set_running(false);
                Err(DeviceError::Io(err))
            }
        }
    }

    fn open_session(&self) -> Result<(Box<dyn DeviceSession>, DeviceDescriptor), DeviceError> {
        let mut link = lock(&self.link);
        let devices = link.enumerate()?;
        let device = select_device(&devices, self.settings.device.as_deref()).ok_or_else(|| {
            DeviceError::Unavailable(match &self.settings.device {
                Some(wanted) => format!("device {wanted} not found among {} devices", devices.len()),
                None => "no devices found".into(),
            })
        })?;

        let mut session = link.open(&device)?;
        if let Err(err) = session.start_capture() {
            session.close();
            return Err(err);
        }
        Ok((session, device))
    }

    /// Ask the loop to exit and wait for it to release the device.
    ///
    /// Returns within roughly one read timeout. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        self.control.set_running(false);
        let Some(Worker { handle, device }) = worker.take() else {
            return;
        };
        if handle.join().is_err() {
            error!("Capture thread for {} panicked", device.id);
        }
        info!("Capture stopped on {}", device.label);
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Descriptor of the device currently grabbing, if any.
    pub fn active_device(&self) -> Option<DeviceDescriptor> {
        lock(&self.worker)
            .as_ref()
            .filter(|w| !w.handle.is_finished())
            .map(|w| w.device.clone())
    }

    pub fn snapshot(&self) -> Option<Arc<CachedFrame>> {
        self.cache.snapshot()
    }

    pub fn control(&self) -> &Arc<ControlSurface> {
        &self.control
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            read_failures: self.stats.read_failures.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
            failure_reports: self.stats.failure_reports.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct LoopContext {
    settings: CaptureSettings,
    control: Arc<ControlSurface>,
    cache: Arc<FrameCache>,
    stats: Arc<CachePadded<LoopStats>>,
    device_id: String,
}

/// Clears the running flag when the loop thread exits, including by unwind.
struct RunningGuard<'a>(&'a ControlSurface);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

fn run_capture_loop(mut session: Box<dyn DeviceSession>, ctx: LoopContext) {
    let span = info_span!("capture_loop", device = %ctx.device_id);
    let _guard = span.enter();
    let _running = RunningGuard(&ctx.control);

    let mut scratch = ScratchBuffer::with_capacity(ctx.settings.scratch_bytes);
    let report_every = ctx.settings.failure_report_every.max(1);
    let mut consecutive_failures: u64 = 0;

    while ctx.control.is_running() {
        let outcome = match session.read_frame(&mut scratch, ctx.settings.read_timeout) {
            Ok(raw) => {
                let convert_start = Instant::now();
                let converted = convert::to_canonical(&raw, ctx.control.gain());
                metrics::histogram!("qc_convert_time_us")
                    .record(convert_start.elapsed().as_micros() as f64);
                converted
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(frame) => {
                consecutive_failures = 0;
                ctx.cache.publish(frame);
                ctx.stats.frames_published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("qc_frames_published_total").increment(1);
            }
            Err(err) => {
                consecutive_failures += 1;
                if matches!(err, DeviceError::Decode(_)) {
                    ctx.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("qc_decode_failures_total").increment(1);
                } else {
                    ctx.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("qc_read_failures_total").increment(1);
                }
                if consecutive_failures % report_every == 0 {
                    ctx.stats.failure_reports.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        consecutive = consecutive_failures,
                        "Frame grab failing: {}", err
                    );
                }
                thread::sleep(ctx.settings.failure_backoff);
            }
        }
    }

    session.close();
    debug!("capture loop exited");
}
